//! Length-prefixed message framing.
//!
//! ```text
//!  0         1                 9        10               14
//!  +---------+-----------------+--------+----------------+-----------------+
//!  | version | id (u64 BE)     | type   | length (u32 BE)| body (length B) |
//!  +---------+-----------------+--------+----------------+-----------------+
//! ```

mod buffer;
mod framed;
pub mod header;

use thiserror::Error;

pub use buffer::{ErrorFn, FrameBuffer, MessageFn};
pub use framed::{encode_options, Message};
pub use header::{Header, HeaderParser, StandardParser, HEADER_LEN, MAX_BODY_LEN, VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough bytes for a header yet. Never fatal.
    #[error("header incomplete, {needed} more bytes needed")]
    Incomplete { needed: usize },

    #[error("invalid start byte {0:#04x}")]
    InvalidVersion(u8),

    #[error("declared body of {declared} bytes exceeds {max}")]
    TooLarge { declared: u32, max: u32 },

    #[error("message id {id} not above last accepted id {last}")]
    ReplayedId { id: u64, last: u64 },

    /// A custom [`HeaderParser`] panicked or returned an unusable header.
    #[error("header parser failed: {0}")]
    Parser(String),

    #[error("malformed message options: {0}")]
    MalformedOptions(String),
}
