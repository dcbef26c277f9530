mod common;

use std::sync::Arc;

use common::{engine, frame, serve, Recorder, Seen};
use mill_conn::{
    error::Error,
    net::{Client, Options, Server, TransportKind},
};
use rustls::{
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ClientConfig, RootCertStore, ServerConfig,
};

struct Pki {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

fn pki() -> Pki {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    Pki {
        cert: certified.cert.der().clone(),
        key: certified.key_pair.serialize_der(),
    }
}

fn server_config(pki: &Pki) -> Arc<ServerConfig> {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki.key.clone()));
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![pki.cert.clone()], key)
        .unwrap();
    Arc::new(config)
}

fn client_config(trusted: Option<&Pki>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    if let Some(pki) = trusted {
        roots.add(pki.cert.clone()).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

#[test]
fn test_tls_echo() {
    let pki = pki();
    let server_side = Recorder::echo();
    let server = Server::with_event_loop("127.0.0.1:0", Arc::clone(&server_side), Options::default(), engine());
    let listener = server.listen_tls(server_config(&pki)).unwrap();
    let addr = listener.local_addr();
    let (stop, handle) = serve(listener);

    let client_side = Recorder::new();
    let client = Client::with_event_loop(addr.to_string(), Arc::clone(&client_side), Options::default(), engine());
    let conn = client.dial_tls(client_config(Some(&pki)), "localhost").unwrap();
    assert_eq!(conn.kind(), TransportKind::Tls);

    client.write(b"over tls").unwrap();
    assert!(server_side.wait_until(|seen| seen.iter().any(|s| matches!(s, Seen::Data(..)))));
    assert_eq!(server_side.data(), b"over tls");
    assert!(client_side.wait_until(|seen| seen.iter().any(|s| matches!(s, Seen::Data(..)))));
    assert_eq!(client_side.data(), b"over tls");

    client.close().unwrap();
    assert!(server_side.wait_until(|seen| seen.iter().any(|s| matches!(s, Seen::Close(..)))));
    assert_eq!(server_side.closes().len(), 1);

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_tls_framed_messages() {
    let pki = pki();
    let server_side = Recorder::framed();
    let server = Server::with_event_loop("127.0.0.1:0", Arc::clone(&server_side), Options::default(), engine());
    let listener = server.listen_tls(server_config(&pki)).unwrap();
    let addr = listener.local_addr();
    let (stop, handle) = serve(listener);

    let client = Client::with_event_loop(addr.to_string(), Recorder::new(), Options::default(), engine());
    client.dial_tls(client_config(Some(&pki)), "localhost").unwrap();

    let mut wire = frame(1, 7, b"first");
    wire.extend_from_slice(&frame(2, 7, b"second"));
    client.write(&wire).unwrap();

    assert!(server_side.wait_until(|seen| {
        seen.iter().filter(|s| matches!(s, Seen::Framed(..))).count() == 2
    }));
    let bodies: Vec<_> = server_side
        .messages()
        .iter()
        .map(|m| m.body.to_vec())
        .collect();
    assert_eq!(bodies, vec![b"first".to_vec(), b"second".to_vec()]);

    client.close().unwrap();
    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_untrusted_certificate_fails_dial() {
    let pki = pki();
    let server = Server::with_event_loop("127.0.0.1:0", Recorder::new(), Options::default(), engine());
    let listener = server.listen_tls(server_config(&pki)).unwrap();
    let addr = listener.local_addr();
    let (stop, handle) = serve(listener);

    let client = Client::with_event_loop(addr.to_string(), Recorder::new(), Options::default(), engine());
    assert!(client.dial_tls(client_config(None), "localhost").is_err());
    assert!(client.connection().is_none());

    stop.stop();
    handle.join().unwrap();
}

#[test]
fn test_invalid_server_name() {
    let pki = pki();
    let server = Server::with_event_loop("127.0.0.1:0", Recorder::new(), Options::default(), engine());
    let listener = server.listen_tls(server_config(&pki)).unwrap();
    let addr = listener.local_addr();
    let (stop, handle) = serve(listener);

    let client = Client::with_event_loop(addr.to_string(), Recorder::new(), Options::default(), engine());
    assert!(matches!(
        client.dial_tls(client_config(Some(&pki)), "not a name!"),
        Err(Error::InvalidServerName(_))
    ));

    stop.stop();
    handle.join().unwrap();
}
