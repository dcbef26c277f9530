use sm3::{Digest, Sm3};

use super::{CryptoError, Method, MethodCode};

/// SM3 digest. One-way: `encrypt` hashes, `decrypt` returns its input.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sm3SumMethod;

impl Method for Sm3SumMethod {
    fn init(&mut self, _key: &[u8], _iv: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        Ok(Sm3::digest(plaintext).to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }

    fn code(&self) -> MethodCode {
        MethodCode::GmSm3Sum
    }
}
