mod common;

use common::h2::{frame, get, read_frame, read_responses, PREFACE, SETTINGS};
use common::{closed_by_peer, config, TestServer};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tributary::transport::tls::server_config;
use tributary::WorkerMode;

fn certificate() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (cert.cert.der().clone(), PrivateKeyDer::Pkcs8(key))
}

fn start(mode: WorkerMode) -> (TestServer, CertificateDer<'static>) {
    let (cert, key) = certificate();
    let tls = server_config(vec![cert.clone()], key, true).unwrap();
    let server = TestServer::start_with(config(mode), move |server| server.with_tls_config(tls));
    (server, cert)
}

fn client(cert: CertificateDer<'static>, alpn: &[u8]) -> rustls::ClientConnection {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];
    let name = ServerName::try_from("localhost").unwrap();
    rustls::ClientConnection::new(Arc::new(config), name).unwrap()
}

fn https_request(mode: WorkerMode) {
    let (server, cert) = start(mode);
    let tcp = server.connect();
    let mut tls = rustls::StreamOwned::new(client(cert, b"http/1.1"), tcp);
    tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tls.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            // a peer that skips close_notify still delivered the response
            Err(_) => break,
        }
    }
    let out = String::from_utf8(out).unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
    assert!(out.ends_with("\r\n\r\nhello"));
    server.stop();
}

#[test]
fn test_https_request_threads() {
    https_request(WorkerMode::Threads);
}

#[test]
fn test_https_request_event_loop() {
    https_request(WorkerMode::EventLoop);
}

fn alpn_h2_speaks_http2(mode: WorkerMode) {
    let (server, cert) = start(mode);
    let tcp = server.connect();
    let mut tls = rustls::StreamOwned::new(client(cert, b"h2"), tcp);
    tls.write_all(PREFACE).unwrap();
    tls.write_all(&frame(SETTINGS, 0, 0, &[])).unwrap();
    assert_eq!(tls.conn.alpn_protocol(), Some(&b"h2"[..]));

    let first = read_frame(&mut tls);
    assert_eq!(first.kind, SETTINGS);
    tls.write_all(&get(1, "/")).unwrap();
    let responses = read_responses(&mut tls, &[1]);
    assert_eq!(responses[0], ("200".to_string(), b"hello".to_vec()));
    server.stop();
}

#[test]
fn test_alpn_h2_speaks_http2_threads() {
    alpn_h2_speaks_http2(WorkerMode::Threads);
}

#[test]
fn test_alpn_h2_speaks_http2_event_loop() {
    alpn_h2_speaks_http2(WorkerMode::EventLoop);
}

#[test]
fn test_alpn_http11_ignores_h2c_upgrade() {
    let (server, cert) = start(WorkerMode::EventLoop);
    let tcp = server.connect();
    let mut tls = rustls::StreamOwned::new(client(cert, b"http/1.1"), tcp);
    tls.write_all(
        b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade, HTTP2-Settings, close\r\n\
          Upgrade: h2c\r\nHTTP2-Settings: \r\n\r\n",
    )
    .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        tls.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    server.stop();
}

fn silent_client_times_out(mode: WorkerMode) {
    let (server, _) = start(mode);
    let mut tcp = server.connect();

    // never send a ClientHello
    let started = Instant::now();
    assert!(closed_by_peer(&mut tcp));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(400), "closed after {waited:?}");
    assert!(waited < Duration::from_secs(3), "closed after {waited:?}");
    server.stop();
}

#[test]
fn test_handshake_timeout_threads() {
    silent_client_times_out(WorkerMode::Threads);
}

#[test]
fn test_handshake_timeout_event_loop() {
    silent_client_times_out(WorkerMode::EventLoop);
}
