//! Protocol implementations.
//!
//! - `dispatch`: decides which protocol a connection or request speaks
//! - `http1`: HTTP/1.1 request/response cycle with keep-alive
//! - `http2`: multiplexed HTTP/2 sessions
//! - `websocket`: RFC 6455 sessions after an HTTP/1.1 upgrade

pub mod dispatch;
pub mod http1;
pub mod http2;
pub mod websocket;

pub use dispatch::Protocol;

use crate::config::Config;
use crate::runtime::TaskExecutor;
use crate::service::Service;
use std::sync::Arc;

/// What a protocol session needs to serve requests.
#[derive(Clone)]
pub struct ServeContext {
    pub config: Arc<Config>,
    pub service: Arc<dyn Service>,
    pub executor: TaskExecutor,
}
