use aes::cipher::{AsyncStreamCipher, KeyIvInit};

use super::{fit_key, CryptoError, Method, MethodCode};

const IV_LEN: usize = 16;

macro_rules! aes_cfb_method {
    ($name:ident, $cipher:ty, $key_len:expr, $code:expr) => {
        /// AES in CFB mode. Key and iv are padded with spaces or truncated to
        /// the cipher sizes.
        #[derive(Default)]
        pub struct $name {
            key: Vec<u8>,
            iv: Vec<u8>,
        }

        impl Method for $name {
            fn init(&mut self, key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
                if key.is_empty() {
                    return Err(CryptoError::InvalidKey("empty key".into()));
                }
                self.key = fit_key(key, $key_len);
                self.iv = fit_key(iv, IV_LEN);
                Ok(())
            }

            fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
                if self.key.is_empty() {
                    return Err(CryptoError::NotInitialized);
                }
                let mut buf = plaintext.to_vec();
                cfb_mode::Encryptor::<$cipher>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| CryptoError::Encrypt(e.to_string()))?
                    .encrypt(&mut buf);
                Ok(buf)
            }

            fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
                if self.key.is_empty() {
                    return Err(CryptoError::NotInitialized);
                }
                let mut buf = ciphertext.to_vec();
                cfb_mode::Decryptor::<$cipher>::new_from_slices(&self.key, &self.iv)
                    .map_err(|e| CryptoError::Decrypt(e.to_string()))?
                    .decrypt(&mut buf);
                Ok(buf)
            }

            fn code(&self) -> MethodCode {
                $code
            }
        }
    };
}

aes_cfb_method!(Aes128CfbMethod, aes::Aes128, 16, MethodCode::Aes128Cfb);
aes_cfb_method!(Aes192CfbMethod, aes::Aes192, 24, MethodCode::Aes192Cfb);
aes_cfb_method!(Aes256CfbMethod, aes::Aes256, 32, MethodCode::Aes256Cfb);
