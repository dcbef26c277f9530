use std::{sync::Arc, time::Duration};

use mill_conn::{
    message::{FrameBuffer, Message},
    net::{Connection, Options, Server},
    Handler,
};
use tracing_subscriber::EnvFilter;

/// Echoes every framed message back with the same type and body.
#[derive(Clone, Default)]
struct FramedEcho;

impl Handler for FramedEcho {
    /// called when a new client connects; every connection gets its own buffer.
    fn on_connect(&self, conn: &Arc<Connection>) {
        tracing::info!(conn_id = conn.id(), remote = %conn.remote_addr(), "client connected");

        let weak = Arc::downgrade(conn);
        let buffer = FrameBuffer::new()
            .validate_id(true)
            .on_message(move |message| {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                tracing::info!(
                    conn_id = conn.id(),
                    id = message.id,
                    kind = message.kind,
                    len = message.body.len(),
                    "message"
                );
                let mut reply = Message::new(message.kind, message.body);
                if let Err(err) = conn.write(&reply.marshal()) {
                    tracing::warn!(conn_id = conn.id(), error = %err, "reply failed");
                }
            })
            .on_error(|err| tracing::warn!(error = %err, "framing stopped"));

        if let Err(err) = conn.set_buffer(buffer) {
            tracing::warn!(conn_id = conn.id(), error = %err, "buffer not installed");
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, reason: &str) {
        tracing::info!(conn_id = conn.id(), reason, "client disconnected");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::builder()
        .encrypt_method("aes-256-cfb")
        .key("0123456789abcdef0123456789abcdef")
        .iv("abcdef0123456789")
        .timeout(Duration::from_secs(60))
        .build()?;

    let server = Server::new("127.0.0.1:8080", FramedEcho, options)?;
    server.run_tcp()?;
    Ok(())
}
