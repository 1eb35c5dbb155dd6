//! tributary: one port for HTTP/1.1, HTTP/2 and WebSocket.
//!
//! Connections are accepted by one of three worker modes (a thread pool,
//! pre-forked processes, or the tokio event loop), optionally wrapped in
//! TLS, and dispatched to the protocol they speak:
//! - HTTP/1.1 with keep-alive, pipelining and chunked bodies
//! - HTTP/2 through ALPN, prior knowledge or the h2c upgrade
//! - WebSocket after an HTTP/1.1 upgrade, with permessage-deflate
//!
//! Applications implement [`Service`]; handlers may block or be async.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocols;
pub mod runtime;
pub mod server;
pub mod service;
pub mod transport;

pub use config::{Config, WorkerMode};
pub use error::{ConnectionError, ServerError};
pub use protocols::websocket::{CloseCode, CloseFrame, OpCode, WebSocketSender, WebSocketView};
pub use runtime::{HandlerError, ShutdownHandle, Task, TaskError};
pub use server::Server;
pub use service::{Body, ConnectionInfo, Request, Response, Service};
