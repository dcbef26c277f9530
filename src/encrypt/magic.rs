//! Obfuscation of small secrets (tokens, node ids) under a built-in key.
//!
//! Both directions use AES-256-CFB with the iv taken from the first 16 key
//! bytes. On any failure the input comes back unchanged.

use super::new_method_instance;

pub const MAGIC_KEY: &str = "f1c8eafb543f03023e97b7be864a4e9b";

fn magic_method() -> Option<Box<dyn super::Method>> {
    let key = MAGIC_KEY.as_bytes();
    new_method_instance("aes-256-cfb", key, &key[..16]).ok()
}

pub fn encode(data: &[u8]) -> Vec<u8> {
    magic_method()
        .and_then(|m| m.encrypt(data).ok())
        .unwrap_or_else(|| data.to_vec())
}

pub fn decode(data: &[u8]) -> Vec<u8> {
    magic_method()
        .and_then(|m| m.decrypt(data).ok())
        .unwrap_or_else(|| data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let hidden = encode(b"node-7");
        assert_ne!(hidden, b"node-7");
        assert_eq!(decode(&hidden), b"node-7");
    }
}
