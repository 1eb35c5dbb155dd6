//! Transport sockets.
//!
//! A socket is either plain TCP or TLS over TCP. Both flavors expose the
//! same contract: orderly shutdown reads as zero bytes, timeouts surface as
//! [`TransportError::Timeout`], and everything else is a hard error.
//!
//! - `BlockingSocket`: std stream, used by the thread-per-connection workers
//! - `AsyncSocket`: tokio stream, used by the event loop and upgraded sessions
//! - `Rewind`: replays bytes read ahead of a protocol switch

mod blocking;
mod nonblocking;
mod rewind;
pub mod tls;

pub use blocking::BlockingSocket;
pub use nonblocking::AsyncSocket;
pub use rewind::Rewind;

use std::io;

/// Which wire the connection runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Tls,
}

impl Transport {
    /// URI scheme the transport implies.
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::Tls => "https",
        }
    }
}

/// Socket-level failures.
#[derive(Debug)]
pub enum TransportError {
    /// No progress within the allowed time.
    Timeout,
    /// The TLS handshake did not finish within its deadline.
    HandshakeTimeout,
    /// The TLS handshake failed.
    Handshake(String),
    /// The peer went away in the middle of an exchange.
    Closed,
    /// Any other I/O failure.
    Io(io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::HandshakeTimeout
        )
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "socket timed out"),
            TransportError::HandshakeTimeout => write!(f, "TLS handshake timed out"),
            TransportError::Handshake(reason) => write!(f, "TLS handshake failed: {reason}"),
            TransportError::Closed => write!(f, "connection closed by peer"),
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // SO_RCVTIMEO surfaces as WouldBlock on unix and TimedOut on windows
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => {
                TransportError::Closed
            }
            _ => TransportError::Io(e),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Map an error raised while the TLS handshake is in progress.
pub(crate) fn handshake_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::HandshakeTimeout,
        io::ErrorKind::UnexpectedEof => {
            TransportError::Handshake("peer closed during handshake".to_string())
        }
        io::ErrorKind::InvalidData => TransportError::Handshake(e.to_string()),
        _ => TransportError::Io(e),
    }
}
