use std::{fmt, sync::Arc, time::Duration};

use crate::{
    encrypt::{Method, MethodRegistry},
    error::{Error, Result},
};

#[derive(Clone)]
struct MethodSpec {
    name: String,
    key: Vec<u8>,
    iv: Vec<u8>,
}

/// Immutable per-connection configuration shared by a server or client.
///
/// Built with [`Options::builder`]; every value is validated when `build`
/// runs, so a bad key or unknown method name never reaches a connection.
///
/// - `timeout`: read deadline, renewed after every read; also bounds how
///   long a write may wait on a full socket buffer
/// - encryption method: name plus key material; each connection gets its
///   own fresh instance
/// - `no_delay`: TCP_NODELAY on accepted and dialed sockets (default on)
/// - `max_connections`: server-side cap on live connections
/// - `reuse_port`: bind server sockets with SO_REUSEADDR and, on unix,
///   SO_REUSEPORT so several processes can share one port (default off)
#[derive(Clone)]
pub struct Options {
    timeout: Option<Duration>,
    method: Option<MethodSpec>,
    registry: Arc<MethodRegistry>,
    no_delay: bool,
    max_connections: Option<usize>,
    reuse_port: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: None,
            method: None,
            registry: MethodRegistry::global(),
            no_delay: true,
            max_connections: None,
            reuse_port: false,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("timeout", &self.timeout)
            .field("method", &self.method_name())
            .field("no_delay", &self.no_delay)
            .field("max_connections", &self.max_connections)
            .field("reuse_port", &self.reuse_port)
            .finish()
    }
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method.as_ref().map(|m| m.name.as_str())
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    pub fn reuse_port(&self) -> bool {
        self.reuse_port
    }

    /// Fresh initialized method for one connection, `None` without
    /// encryption.
    pub fn new_method(&self) -> Result<Option<Box<dyn Method>>> {
        match &self.method {
            None => Ok(None),
            Some(spec) => Ok(Some(self.registry.create_initialized(
                &spec.name,
                &spec.key,
                &spec.iv,
            )?)),
        }
    }
}

/// Builder for [`Options`]. Unset fields take the defaults of
/// `Options::default()`.
#[derive(Default)]
pub struct OptionsBuilder {
    timeout: Option<Duration>,
    method: Option<String>,
    key: Option<Vec<u8>>,
    iv: Option<Vec<u8>>,
    registry: Option<Arc<MethodRegistry>>,
    no_delay: Option<bool>,
    max_connections: Option<usize>,
    reuse_port: Option<bool>,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encryption method by registry name, e.g. `"aes-256-cfb"`.
    pub fn encrypt_method(mut self, name: impl Into<String>) -> Self {
        self.method = Some(name.into());
        self
    }

    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn iv(mut self, iv: impl Into<Vec<u8>>) -> Self {
        self.iv = Some(iv.into());
        self
    }

    /// Private key for `gm-sm2-ecc`; occupies the key slot.
    pub fn private_key(self, key: impl Into<Vec<u8>>) -> Self {
        self.key(key)
    }

    /// Public key for `gm-sm2-ecc`; occupies the iv slot.
    pub fn public_key(self, key: impl Into<Vec<u8>>) -> Self {
        self.iv(key)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    /// Registry used to resolve the method name. Defaults to the built-ins.
    pub fn method_registry(mut self, registry: Arc<MethodRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Options> {
        let default = Options::default();

        if matches!(&self.key, Some(k) if k.is_empty()) {
            return Err(Error::Config("key must not be empty".into()));
        }
        if matches!(&self.iv, Some(iv) if iv.is_empty()) {
            return Err(Error::Config("iv must not be empty".into()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::Config("timeout must be positive".into()));
        }
        if self.max_connections == Some(0) {
            return Err(Error::Config("max_connections must be positive".into()));
        }

        let registry = self.registry.unwrap_or(default.registry);
        let method = match self.method {
            Some(name) => {
                let spec = MethodSpec {
                    name,
                    key: self.key.unwrap_or_default(),
                    iv: self.iv.unwrap_or_default(),
                };
                // surfaces unknown names and rejected key material now
                registry.create_initialized(&spec.name, &spec.key, &spec.iv)?;
                Some(spec)
            }
            None if self.key.is_some() || self.iv.is_some() => {
                return Err(Error::Config(
                    "key material given without an encryption method".into(),
                ))
            }
            None => None,
        };

        Ok(Options {
            timeout: self.timeout.or(default.timeout),
            method,
            registry,
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            max_connections: self.max_connections.or(default.max_connections),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::{CryptoError, MethodCode, RawMethod};

    #[test]
    fn test_defaults() {
        let options = Options::builder().build().unwrap();
        assert!(options.timeout().is_none());
        assert!(options.method_name().is_none());
        assert!(options.no_delay());
        assert!(options.max_connections().is_none());
        assert!(!options.reuse_port());
        assert!(options.new_method().unwrap().is_none());
    }

    #[test]
    fn test_method_instances_are_fresh() {
        let options = Options::builder()
            .encrypt_method("aes-256-cfb")
            .key("0123456789abcdef0123456789abcdef")
            .iv("abcdef0123456789")
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap();

        let a = options.new_method().unwrap().unwrap();
        let b = options.new_method().unwrap().unwrap();
        assert_eq!(a.code(), MethodCode::Aes256Cfb);
        assert_eq!(b.decrypt(&a.encrypt(b"x").unwrap()).unwrap(), b"x");
        assert_eq!(options.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_invalid_values_fail_at_build() {
        assert!(matches!(
            Options::builder().encrypt_method("aes-128-cfb").key("").build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Options::builder().timeout(Duration::ZERO).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Options::builder().encrypt_method("nope").build(),
            Err(Error::Crypto(CryptoError::UnknownMethod(_)))
        ));
        assert!(matches!(
            Options::builder().encrypt_method("aes-128-cfb").build(),
            Err(Error::Crypto(CryptoError::InvalidKey(_)))
        ));
        assert!(matches!(
            Options::builder().key("orphan").build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_custom_registry() {
        let mut registry = MethodRegistry::empty();
        registry.register("identity", || Box::new(RawMethod));
        let options = Options::builder()
            .method_registry(Arc::new(registry))
            .encrypt_method("identity")
            .build()
            .unwrap();
        assert_eq!(options.method_name(), Some("identity"));
        assert!(Options::builder()
            .method_registry(Arc::new(MethodRegistry::empty()))
            .encrypt_method("raw")
            .build()
            .is_err());
    }
}
