use std::sync::Arc;

use crate::net::Connection;

/// Application callbacks for one server or client.
///
/// Every method has a no-op default, so handlers only implement what they
/// use. `on_message` runs on the connection's worker, so deliveries for one
/// connection never overlap and arrive in order. `on_connect` runs on the
/// accepting or dialing thread (the receive thread for UDP servers), and
/// `on_close` runs on whichever thread closed the connection, possibly
/// while a delivery is still in progress. Nothing is delivered once
/// `on_close` has started.
pub trait Handler: Send + Sync + 'static {
    /// A TCP or TLS connection was established. For UDP servers this fires
    /// once per received datagram.
    fn on_connect(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// Decrypted bytes, delivered when no frame buffer is installed.
    fn on_message(&self, conn: &Arc<Connection>, data: &[u8]) {
        let _ = (conn, data);
    }

    /// Fires exactly once per connection. `reason` is `"timeout"`,
    /// `"client close"`, `"peer hang-up"`, or whatever the closing code
    /// supplied.
    fn on_close(&self, conn: &Arc<Connection>, reason: &str) {
        let _ = (conn, reason);
    }
}

/// Handler that ignores everything, for dial-and-write clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

impl<H: Handler> Handler for Arc<H> {
    fn on_connect(&self, conn: &Arc<Connection>) {
        (**self).on_connect(conn)
    }

    fn on_message(&self, conn: &Arc<Connection>, data: &[u8]) {
        (**self).on_message(conn, data)
    }

    fn on_close(&self, conn: &Arc<Connection>, reason: &str) {
        (**self).on_close(conn, reason)
    }
}
