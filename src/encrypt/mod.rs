//! Pluggable payload encryption.
//!
//! A connection holds at most one [`Method`]; it encrypts every outbound
//! buffer at the final write step and decrypts every inbound buffer before
//! framing. Methods are resolved by name through a [`MethodRegistry`], a
//! static table of constructors that callers may extend.
//!
//! | name          | code | kind                  |
//! |---------------|------|-----------------------|
//! | `raw`         | 0    | pass-through          |
//! | `aes-128-cfb` | 1    | block cipher, CFB     |
//! | `aes-192-cfb` | 2    | block cipher, CFB     |
//! | `aes-256-cfb` | 3    | block cipher, CFB     |
//! | `gm-sm2-ecc`  | 4    | public key            |
//! | `gm-sm3-sum`  | 5    | digest (one-way)      |
//! | `gm-sm4-cbc`  | 6    | block cipher, CBC     |

mod aes_cfb;
pub mod magic;
mod raw;
mod sm2;
mod sm3;
mod sm4;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use thiserror::Error;

pub use aes_cfb::{Aes128CfbMethod, Aes192CfbMethod, Aes256CfbMethod};
pub use raw::RawMethod;
pub use sm2::Sm2EccMethod;
pub use sm3::Sm3SumMethod;
pub use sm4::Sm4CbcMethod;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("method '{0}' not found")]
    UnknownMethod(String),

    #[error("unknown method code {0}")]
    UnknownCode(u8),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encrypt failed: {0}")]
    Encrypt(String),

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("method used before init")]
    NotInitialized,
}

/// Stable one-byte identifiers of the built-in methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MethodCode {
    Raw = 0,
    Aes128Cfb = 1,
    Aes192Cfb = 2,
    Aes256Cfb = 3,
    GmSm2Ecc = 4,
    GmSm3Sum = 5,
    GmSm4Cbc = 6,
}

impl MethodCode {
    pub fn name(self) -> &'static str {
        match self {
            MethodCode::Raw => "raw",
            MethodCode::Aes128Cfb => "aes-128-cfb",
            MethodCode::Aes192Cfb => "aes-192-cfb",
            MethodCode::Aes256Cfb => "aes-256-cfb",
            MethodCode::GmSm2Ecc => "gm-sm2-ecc",
            MethodCode::GmSm3Sum => "gm-sm3-sum",
            MethodCode::GmSm4Cbc => "gm-sm4-cbc",
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => MethodCode::Raw,
            1 => MethodCode::Aes128Cfb,
            2 => MethodCode::Aes192Cfb,
            3 => MethodCode::Aes256Cfb,
            4 => MethodCode::GmSm2Ecc,
            5 => MethodCode::GmSm3Sum,
            6 => MethodCode::GmSm4Cbc,
            _ => return None,
        })
    }
}

impl fmt::Display for MethodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A payload transform applied symmetrically on a connection.
///
/// `init` receives the configured key material: a symmetric key and iv for
/// the block ciphers, the raw private and public keys for `gm-sm2-ecc`.
pub trait Method: Send + Sync {
    fn init(&mut self, key: &[u8], iv: &[u8]) -> Result<(), CryptoError>;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn code(&self) -> MethodCode;
}

pub type MethodCtor = fn() -> Box<dyn Method>;

/// Name to constructor table.
#[derive(Clone)]
pub struct MethodRegistry {
    ctors: HashMap<String, MethodCtor>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("MethodRegistry").field("methods", &names).finish()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registry holding every built-in method.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("raw", || Box::new(RawMethod));
        registry.register("aes-128-cfb", || Box::<Aes128CfbMethod>::default());
        registry.register("aes-192-cfb", || Box::<Aes192CfbMethod>::default());
        registry.register("aes-256-cfb", || Box::<Aes256CfbMethod>::default());
        registry.register("gm-sm2-ecc", || Box::<Sm2EccMethod>::default());
        registry.register("gm-sm3-sum", || Box::new(Sm3SumMethod));
        registry.register("gm-sm4-cbc", || Box::<Sm4CbcMethod>::default());
        registry
    }

    /// Process-wide registry of the built-in methods.
    pub fn global() -> Arc<MethodRegistry> {
        static GLOBAL: OnceLock<Arc<MethodRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MethodRegistry::with_defaults())))
    }

    /// Adds or replaces the constructor for `name`.
    pub fn register(&mut self, name: impl Into<String>, ctor: MethodCtor) -> &mut Self {
        self.ctors.insert(name.into(), ctor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Fresh, uninitialized instance.
    pub fn create(&self, name: &str) -> Result<Box<dyn Method>, CryptoError> {
        self.ctors
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| CryptoError::UnknownMethod(name.to_string()))
    }

    /// Fresh instance with `init` already applied.
    pub fn create_initialized(
        &self,
        name: &str,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Box<dyn Method>, CryptoError> {
        let mut method = self.create(name)?;
        method.init(key, iv)?;
        Ok(method)
    }
}

/// Uninitialized built-in method by name.
pub fn new_method(name: &str) -> Result<Box<dyn Method>, CryptoError> {
    MethodRegistry::global().create(name)
}

/// Initialized built-in method by name.
pub fn new_method_instance(name: &str, key: &[u8], iv: &[u8]) -> Result<Box<dyn Method>, CryptoError> {
    MethodRegistry::global().create_initialized(name, key, iv)
}

/// Initialized built-in method by its one-byte code.
pub fn method_by_code(code: u8, key: &[u8], iv: &[u8]) -> Result<Box<dyn Method>, CryptoError> {
    let code = MethodCode::from_u8(code).ok_or(CryptoError::UnknownCode(code))?;
    new_method_instance(code.name(), key, iv)
}

/// Truncates `material` to `size` bytes or pads it with ASCII spaces.
pub(crate) fn fit_key(material: &[u8], size: usize) -> Vec<u8> {
    let mut fitted: Vec<u8> = material.iter().copied().take(size).collect();
    fitted.resize(size, b' ');
    fitted
}
