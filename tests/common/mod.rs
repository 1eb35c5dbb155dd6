//! Shared harness: an in-process server on an ephemeral port.

#![allow(dead_code)]

pub mod h2;

use bytes::Bytes;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;
use tributary::{
    Body, Config, OpCode, Request, Response, Server, Service, ShutdownHandle, Task,
    WebSocketSender, WebSocketView, WorkerMode,
};

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: Config) -> Self {
        Self::start_with(config, |server| server)
    }

    pub fn start_with(config: Config, customize: impl FnOnce(Server) -> Server) -> Self {
        let server = customize(Server::bind(config, App).unwrap());
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.run().unwrap());
        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Trigger shutdown and wait for `run` to return.
    pub fn stop(mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

pub fn config(mode: WorkerMode) -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        worker_mode: mode,
        workers: 2,
        queue_depth: 8,
        shutdown_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Test application: echo on `/echo`, chunks on `/chunks`, WebSocket echo
/// on `/ws`, a greeting anywhere else.
pub struct App;

impl Service for App {
    fn call(&self, request: Request) -> Task<Response> {
        match request.uri().path() {
            "/echo" => Task::ready(Response::new(Body::from(request.into_body()))),
            "/chunks" => Task::ready(Response::new(Body::from_iter(vec![
                Ok(Bytes::from_static(b"hello ")),
                Ok(Bytes::from_static(b"world")),
            ]))),
            _ => Task::blocking(|| Ok(Response::new(Body::from("hello")))),
        }
    }

    fn websocket(&self, request: &Request) -> Option<Box<dyn WebSocketView>> {
        (request.uri().path() == "/ws").then(|| Box::new(Echo) as Box<dyn WebSocketView>)
    }
}

struct Echo;

impl WebSocketView for Echo {
    fn on_receive(&mut self, sender: &WebSocketSender, payload: Bytes, opcode: OpCode) {
        let _ = match opcode {
            OpCode::Text => sender.send_text(String::from_utf8_lossy(&payload).into_owned()),
            _ => sender.send_binary(payload),
        };
    }
}

/// Read one HTTP/1.1 response with a Content-Length body.
pub fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed inside a response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length: "))
        .map(|len| len.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

/// True once the peer has closed: a read returns EOF or a reset.
pub fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

pub fn send(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).unwrap();
}
