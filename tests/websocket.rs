mod common;

use common::{closed_by_peer, config, send, TestServer};
use std::io::Read;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tributary::WorkerMode;

const UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\nHost: test\r\nConnection: Upgrade\r\n\
    Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// A masked client frame.
fn client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mask = [0x12, 0x34, 0x56, 0x78];
    let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

/// Read one unmasked server frame: (opcode, payload).
fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames are never masked");
    let len = match header[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (header[0] & 0x0f, payload)
}

fn handshake_and_echo(mode: WorkerMode) {
    let server = TestServer::start(config(mode));
    let mut stream = server.connect();
    send(&mut stream, UPGRADE);

    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    send(&mut stream, &client_frame(0x1, b"hi there"));
    assert_eq!(read_frame(&mut stream), (0x1, b"hi there".to_vec()));

    // close with 1000 is echoed, then the socket is released
    send(&mut stream, &client_frame(0x8, &[0x03, 0xe8]));
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &[0x03, 0xe8]);
    assert!(closed_by_peer(&mut stream));
    server.stop();
}

#[test]
fn test_handshake_and_echo_threads() {
    handshake_and_echo(WorkerMode::Threads);
}

#[test]
fn test_handshake_and_echo_event_loop() {
    handshake_and_echo(WorkerMode::EventLoop);
}

#[test]
fn test_ping_is_answered() {
    let server = TestServer::start(config(WorkerMode::EventLoop));
    let mut stream = server.connect();
    send(&mut stream, UPGRADE);
    read_head(&mut stream);

    send(&mut stream, &client_frame(0x9, b"beat"));
    assert_eq!(read_frame(&mut stream), (0xA, b"beat".to_vec()));
    server.stop();
}

#[test]
fn test_unmasked_frame_is_protocol_error() {
    let server = TestServer::start(config(WorkerMode::EventLoop));
    let mut stream = server.connect();
    send(&mut stream, UPGRADE);
    read_head(&mut stream);

    send(&mut stream, &[0x81, 0x02, b'h', b'i']);
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);
    assert!(closed_by_peer(&mut stream));
    server.stop();
}

#[test]
fn test_unresponsive_peer_is_closed() {
    let mut config = config(WorkerMode::EventLoop);
    config.websocket.ping_interval = Duration::from_millis(200);
    config.websocket.pong_timeout = Duration::from_millis(300);
    let server = TestServer::start(config);
    let mut stream = server.connect();
    send(&mut stream, UPGRADE);
    read_head(&mut stream);

    // never answer the pings
    let started = Instant::now();
    assert!(closed_by_peer(&mut stream));
    assert!(started.elapsed() < Duration::from_secs(4));
    server.stop();
}

#[test]
fn test_unsupported_version_gets_426() {
    let server = TestServer::start(config(WorkerMode::Threads));
    let mut stream = server.connect();
    let request = std::str::from_utf8(UPGRADE)
        .unwrap()
        .replace("Version: 13", "Version: 8");
    send(&mut stream, request.as_bytes());
    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
    assert!(head.contains("sec-websocket-version: 13\r\n"));
    server.stop();
}
