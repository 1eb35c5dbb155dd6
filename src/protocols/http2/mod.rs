//! HTTP/2 (RFC 9113) sessions.
//!
//! - `frame`: sans-io frame codec and SETTINGS
//! - `flow`: send and receive windows
//! - `stream`: per-stream state machine
//! - `hpack`: request/response header blocks over `fluke-hpack`
//! - `session`: the connection loop that ties them together

pub mod flow;
pub mod frame;
pub mod hpack;
mod session;
pub mod stream;

pub use frame::{ErrorCode, Settings};
pub use session::{serve, H2cUpgrade};

use std::io;

/// Errors that end an HTTP/2 connection.
#[derive(Debug)]
pub enum H2Error {
    /// Connection error; the session answers with GOAWAY carrying `code`.
    Protocol { code: ErrorCode, reason: &'static str },
    /// Transport failure. Nothing more can be written.
    Io(io::Error),
}

impl H2Error {
    pub fn protocol(reason: &'static str) -> Self {
        H2Error::Protocol {
            code: ErrorCode::PROTOCOL_ERROR,
            reason,
        }
    }

    pub fn with_code(code: ErrorCode, reason: &'static str) -> Self {
        H2Error::Protocol { code, reason }
    }

    /// Error code for the GOAWAY frame, if one can still be sent.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            H2Error::Protocol { code, .. } => Some(*code),
            H2Error::Io(_) => None,
        }
    }
}

impl std::fmt::Display for H2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            H2Error::Protocol { code, reason } => write!(f, "{code}: {reason}"),
            H2Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for H2Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            H2Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for H2Error {
    fn from(e: io::Error) -> Self {
        H2Error::Io(e)
    }
}

pub type H2Result<T> = Result<T, H2Error>;
