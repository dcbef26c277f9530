use std::{
    sync::{mpsc, Arc, Mutex},
    time::Duration,
};

use mill_conn::{
    message::{FrameBuffer, Message},
    net::{Client, Connection, Options},
    Handler,
};
use tracing_subscriber::EnvFilter;

/// Collects replies from the framed echo server.
struct Replies {
    tx: Mutex<mpsc::Sender<Message>>,
}

impl Handler for Replies {
    fn on_connect(&self, conn: &Arc<Connection>) {
        let tx = match self.tx.lock() {
            Ok(tx) => tx.clone(),
            Err(_) => return,
        };
        let tx = Mutex::new(tx);
        let buffer = FrameBuffer::new().on_message(move |message| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(message);
            }
        });
        if let Err(err) = conn.set_buffer(buffer) {
            tracing::warn!(error = %err, "buffer not installed");
        }
    }

    fn on_close(&self, conn: &Arc<Connection>, reason: &str) {
        tracing::info!(conn_id = conn.id(), reason, "connection closed");
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
        .timeout(Duration::from_secs(10))
        .build()?;

    let (tx, rx) = mpsc::channel();
    let client = Client::new("127.0.0.1:8080", Replies { tx: Mutex::new(tx) }, options)?;
    client.dial_tcp()?;

    for (kind, text) in [(1u8, "hello"), (2, "framed"), (3, "world")] {
        let mut message = Message::new(kind, text.as_bytes().to_vec());
        client.write(&message.marshal())?;
        let reply = rx.recv_timeout(Duration::from_secs(5))?;
        println!(
            "reply id={} type={} body={}",
            reply.id,
            reply.kind,
            String::from_utf8_lossy(&reply.body)
        );
    }

    client.close()?;
    Ok(())
}
