use sm2::{
    pke::{DecryptingKey, EncryptingKey, Mode},
    PublicKey, SecretKey,
};

use super::{CryptoError, Method, MethodCode};

const PRIVATE_KEY_LEN: usize = 32;
const RAW_PUBLIC_KEY_LEN: usize = 64;

/// SM2 public-key encryption, ciphertext layout C1C2C3.
///
/// `init(private, public)`: the private key is the raw 32-byte scalar, the
/// public key the raw 64-byte `x || y` point (a SEC1-encoded point is also
/// accepted). Either half may be used on its own: a sender only needs the
/// public key, a receiver only the private key.
#[derive(Default)]
pub struct Sm2EccMethod {
    encrypting: Option<EncryptingKey>,
    decrypting: Option<DecryptingKey>,
}

fn parse_public(raw: &[u8]) -> Result<PublicKey, CryptoError> {
    let sec1 = if raw.len() == RAW_PUBLIC_KEY_LEN {
        let mut point = Vec::with_capacity(RAW_PUBLIC_KEY_LEN + 1);
        point.push(0x04);
        point.extend_from_slice(raw);
        point
    } else {
        raw.to_vec()
    };
    PublicKey::from_sec1_bytes(&sec1).map_err(|e| CryptoError::InvalidKey(format!("sm2 public key: {e}")))
}

fn parse_private(raw: &[u8]) -> Result<SecretKey, CryptoError> {
    if raw.len() != PRIVATE_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "sm2 private key must be {PRIVATE_KEY_LEN} bytes, got {}",
            raw.len()
        )));
    }
    SecretKey::from_slice(raw).map_err(|e| CryptoError::InvalidKey(format!("sm2 private key: {e}")))
}

impl Method for Sm2EccMethod {
    fn init(&mut self, private_key: &[u8], public_key: &[u8]) -> Result<(), CryptoError> {
        if private_key.is_empty() && public_key.is_empty() {
            return Err(CryptoError::InvalidKey("sm2 needs a private or public key".into()));
        }
        self.encrypting = if public_key.is_empty() {
            None
        } else {
            Some(EncryptingKey::new_with_mode(parse_public(public_key)?, Mode::C1C2C3))
        };
        self.decrypting = if private_key.is_empty() {
            None
        } else {
            let secret = parse_private(private_key)?;
            Some(DecryptingKey::new_with_mode(secret.to_nonzero_scalar(), Mode::C1C2C3))
        };
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.encrypting.as_ref().ok_or(CryptoError::NotInitialized)?;
        key.encrypt(plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.decrypting.as_ref().ok_or(CryptoError::NotInitialized)?;
        key.decrypt(ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn code(&self) -> MethodCode {
        MethodCode::GmSm2Ecc
    }
}

#[cfg(test)]
mod tests {
    use sm2::elliptic_curve::sec1::ToSec1Point;

    use super::*;

    fn key_pair() -> (Vec<u8>, Vec<u8>) {
        let mut private = [0u8; 32];
        private[31] = 0x2a;
        private[0] = 0x11;
        let secret = SecretKey::from_slice(&private).unwrap();
        let point = secret.public_key().to_encoded_point(false);
        (private.to_vec(), point.as_bytes()[1..].to_vec())
    }

    #[test]
    fn test_round_trip_with_raw_keys() {
        let (private, public) = key_pair();
        assert_eq!(public.len(), 64);

        let mut method = Sm2EccMethod::default();
        method.init(&private, &public).unwrap();
        let sealed = method.encrypt(b"gm payload").unwrap();
        assert_ne!(&sealed[..], b"gm payload");
        assert_eq!(method.decrypt(&sealed).unwrap(), b"gm payload");
    }

    #[test]
    fn test_sender_and_receiver_halves() {
        let (private, public) = key_pair();
        let mut sender = Sm2EccMethod::default();
        sender.init(b"", &public).unwrap();
        let mut receiver = Sm2EccMethod::default();
        receiver.init(&private, b"").unwrap();

        let sealed = sender.encrypt(b"one way").unwrap();
        assert_eq!(receiver.decrypt(&sealed).unwrap(), b"one way");
        assert!(matches!(sender.decrypt(&sealed), Err(CryptoError::NotInitialized)));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let mut method = Sm2EccMethod::default();
        assert!(method.init(b"short", b"").is_err());
        assert!(method.init(b"", &[7u8; 64]).is_err());
        assert!(method.init(b"", b"").is_err());
    }
}
