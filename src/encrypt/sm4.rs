use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::{fit_key, CryptoError, Method, MethodCode};

const BLOCK_SIZE: usize = 16;

type Sm4CbcEnc = cbc::Encryptor<sm4::Sm4>;
type Sm4CbcDec = cbc::Decryptor<sm4::Sm4>;

/// SM4 in CBC mode with PKCS#7 padding. Key and iv are fitted to 16 bytes.
#[derive(Default)]
pub struct Sm4CbcMethod {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl Method for Sm4CbcMethod {
    fn init(&mut self, key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
        if key.is_empty() {
            return Err(CryptoError::InvalidKey("empty key".into()));
        }
        self.key = fit_key(key, BLOCK_SIZE);
        self.iv = fit_key(iv, BLOCK_SIZE);
        Ok(())
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.key.is_empty() {
            return Err(CryptoError::NotInitialized);
        }
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        let cipher = Sm4CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.key.is_empty() {
            return Err(CryptoError::NotInitialized);
        }
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        let cipher = Sm4CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    fn code(&self) -> MethodCode {
        MethodCode::GmSm4Cbc
    }
}
