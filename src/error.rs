//! Error types shared by every layer of the engine.

use thiserror::Error;

use crate::encrypt::CryptoError;
use crate::message::FrameError;

/// Main error type for engine, connection and configuration operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a socket, poll instance or thread spawn.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was already closed when the operation started.
    #[error("connection closed")]
    ConnectionClosed,

    /// `Client::write` was called before a dial succeeded.
    #[error("not dialed to server")]
    NotDialed,

    /// UDP client connections never receive data, so they cannot own a frame buffer.
    #[error("udp client connections cannot install a frame buffer")]
    BufferUnsupported,

    /// Invalid option or engine configuration, reported at construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Encryption method lookup, key material or transform failure.
    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// Fatal framing condition.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// TLS protocol or configuration failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The name handed to a TLS dial is not a valid DNS name or IP address.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// The executor behind the event loop has shut down.
    #[error("event loop is gone")]
    EventLoopGone,

    /// A lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    PoisonedLock(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::PoisonedLock(err.to_string())
    }
}
