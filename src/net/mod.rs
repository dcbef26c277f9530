//! Transport layer: servers, clients and the connections they create.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────┐              │
//! │  │ Server /     │────────▶│ Your Handler    │              │
//! │  │ Client       │          │ (Handler trait) │              │
//! │  └──────────────┘          └─────────────────┘              │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ accept / dial        │ on_connect, on_message,
//!              ▼                      │ on_close
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Connection                           │
//! │  Socket (TCP | TLS | UDP) ── Method ── FrameBuffer          │
//! │  Worker (serialized callbacks)                              │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ register / stop / deadlines
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             EventLoop: Multiplexer, ThreadPool,             │
//! │                 BytePool, Registry                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! TCP and TLS sockets are read through the engine's multiplexer. UDP
//! servers read datagrams on a loop of their own; UDP clients only send.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//! use mill_conn::{net::{Connection, Options, Server}, Handler, error::Result};
//!
//! struct EchoHandler;
//!
//! impl Handler for EchoHandler {
//!     fn on_message(&self, conn: &Arc<Connection>, data: &[u8]) {
//!         let _ = conn.write(data);
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let options = Options::builder()
//!     .encrypt_method("aes-256-cfb")
//!     .key("0123456789abcdef0123456789abcdef")
//!     .iv("abcdef0123456789")
//!     .timeout(Duration::from_secs(30))
//!     .build()?;
//!
//! Server::new("127.0.0.1:8080", EchoHandler, options)?.run_tcp()
//! # }
//! ```

mod client;
pub mod config;
mod connection;
pub mod registry;
mod server;
mod socket;
mod tls;

pub use client::Client;
pub use config::{Options, OptionsBuilder};
pub use connection::{
    Connection, Role, TransportKind, REASON_CLIENT_CLOSE, REASON_PEER_HANG_UP, REASON_TIMEOUT,
};
pub use registry::Registry;
pub use server::{DatagramListener, Listener, Server, StopHandle};
