//! tributary demo server.
//!
//! Serves a greeting on `/`, a chunked counter on `/stream` and a
//! WebSocket echo on `/ws`.

use bytes::Bytes;
use std::time::Duration;
use tracing::{error, info};
use tributary::{
    Body, Config, OpCode, Request, Response, Server, Service, Task, WebSocketSender, WebSocketView,
};

struct Demo;

impl Service for Demo {
    fn call(&self, request: Request) -> Task<Response> {
        match request.uri().path() {
            "/stream" => Task::future(async {
                let ticks = futures_util::stream::unfold(0u32, |n| async move {
                    if n == 5 {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Some((Ok::<_, std::io::Error>(Bytes::from(format!("tick {n}\n"))), n + 1))
                });
                Ok(Response::new(Body::from_stream(ticks)))
            }),
            _ => Task::blocking(|| Ok(Response::new(Body::from("Hello from tributary\n")))),
        }
    }

    fn websocket(&self, request: &Request) -> Option<Box<dyn WebSocketView>> {
        (request.uri().path() == "/ws").then(|| Box::new(Echo) as Box<dyn WebSocketView>)
    }
}

struct Echo;

impl WebSocketView for Echo {
    fn on_receive(&mut self, sender: &WebSocketSender, payload: Bytes, opcode: OpCode) {
        let sent = match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => sender.send_text(text),
                Err(_) => return,
            },
            _ => sender.send_binary(payload),
        };
        if let Err(e) = sent {
            info!(error = %e, "Echo failed");
        }
    }
}

fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tributary: {e}");
            std::process::exit(2);
        }
    };
    tributary::logging::init(&config.log_level);

    info!(
        listen = %config.listen,
        worker_mode = ?config.worker_mode,
        workers = config.workers,
        tls = config.tls.is_some(),
        http2 = config.http2.enabled,
        keepalive_timeout_secs = config.http.keepalive_timeout.as_secs(),
        "Starting tributary"
    );

    let result = Server::bind(config, Demo).and_then(Server::run);
    if let Err(e) = result {
        error!(error = %e, "Server failed");
        tributary::logging::flush();
        std::process::exit(1);
    }
}
