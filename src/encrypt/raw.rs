use super::{CryptoError, Method, MethodCode};

/// Pass-through.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawMethod;

impl Method for RawMethod {
    fn init(&mut self, _key: &[u8], _iv: &[u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }

    fn code(&self) -> MethodCode {
        MethodCode::Raw
    }
}
