//! WebSocket (RFC 6455) sessions.
//!
//! - `frame`: wire codec with masking and size rules
//! - `close`: close codes and CLOSE payloads
//! - `handshake`: upgrade validation and the 101 response
//! - `deflate`: permessage-deflate (RFC 7692)
//! - `session`: receive loop, heartbeat and the single writer

pub mod close;
pub mod deflate;
pub mod frame;
pub mod handshake;
mod session;

pub use close::{CloseCode, CloseFrame};
pub use frame::{Frame, OpCode, Role};
pub use session::{
    SendError, SessionState, SessionStateHandle, WebSocketSender, WebSocketSession, WebSocketView,
};

use std::io;

/// Errors that end a WebSocket session.
#[derive(Debug)]
pub enum WsError {
    /// Peer violated the framing rules.
    Protocol(&'static str),
    /// A text message or close reason was not valid UTF-8.
    InvalidUtf8,
    /// Frame or reassembled message exceeded the configured limit.
    MessageTooBig { size: usize, limit: usize },
    /// Compressed payload could not be inflated.
    Compression(String),
    /// No traffic within the pong timeout.
    HeartbeatTimeout,
    /// Transport failure.
    Io(io::Error),
}

impl WsError {
    /// Close code sent to the peer for this failure.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WsError::Protocol(_) => CloseCode::Protocol,
            WsError::InvalidUtf8 => CloseCode::InvalidData,
            WsError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            WsError::Compression(_) => CloseCode::InvalidData,
            WsError::HeartbeatTimeout => CloseCode::Abnormal,
            WsError::Io(_) => CloseCode::Abnormal,
        }
    }
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WsError::Protocol(reason) => write!(f, "websocket protocol error: {reason}"),
            WsError::InvalidUtf8 => write!(f, "invalid UTF-8 in text payload"),
            WsError::MessageTooBig { size, limit } => {
                write!(f, "message of {size} bytes exceeds limit of {limit}")
            }
            WsError::Compression(reason) => write!(f, "permessage-deflate error: {reason}"),
            WsError::HeartbeatTimeout => write!(f, "peer stopped responding to pings"),
            WsError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for WsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WsError {
    fn from(e: io::Error) -> Self {
        WsError::Io(e)
    }
}

pub type WsResult<T> = Result<T, WsError>;
