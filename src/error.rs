//! Connection and server errors.
//!
//! Protocol modules keep their own error types; these wrap them at the two
//! boundaries that matter: a single connection, and server startup.

use crate::config::ConfigError;
use crate::protocols::http1::Http1Error;
use crate::protocols::http2::H2Error;
use crate::transport::tls::TlsConfigError;
use crate::transport::TransportError;
use std::io;
use std::net::SocketAddr;

/// Ends one connection. Logged and turned into a close; never reaches the
/// accept loop.
#[derive(Debug)]
pub enum ConnectionError {
    Transport(TransportError),
    Http1(Http1Error),
    Http2(H2Error),
    /// The response body failed after its head was written.
    Body(io::Error),
    /// A sized response body did not match its Content-Length.
    BodyLength { expected: u64, written: u64 },
}

impl ConnectionError {
    /// Timeouts and peers going away are routine.
    pub fn is_routine(&self) -> bool {
        match self {
            ConnectionError::Transport(e) => {
                matches!(e, TransportError::Timeout | TransportError::Closed)
            }
            ConnectionError::Http2(H2Error::Io(e)) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Transport(e) => write!(f, "transport: {e}"),
            ConnectionError::Http1(e) => write!(f, "HTTP/1.1: {e}"),
            ConnectionError::Http2(e) => write!(f, "HTTP/2: {e}"),
            ConnectionError::Body(e) => write!(f, "response body failed: {e}"),
            ConnectionError::BodyLength { expected, written } => write!(
                f,
                "response body was {written} bytes, Content-Length promised {expected}"
            ),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Transport(e) => Some(e),
            ConnectionError::Http1(e) => Some(e),
            ConnectionError::Http2(e) => Some(e),
            ConnectionError::Body(e) => Some(e),
            ConnectionError::BodyLength { .. } => None,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        ConnectionError::Transport(e)
    }
}

impl From<Http1Error> for ConnectionError {
    fn from(e: Http1Error) -> Self {
        ConnectionError::Http1(e)
    }
}

impl From<H2Error> for ConnectionError {
    fn from(e: H2Error) -> Self {
        ConnectionError::Http2(e)
    }
}

/// Startup failures.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Tls(TlsConfigError),
    Bind(SocketAddr, io::Error),
    Runtime(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "{e}"),
            ServerError::Tls(e) => write!(f, "TLS configuration: {e}"),
            ServerError::Bind(addr, e) => write!(f, "failed to bind {addr}: {e}"),
            ServerError::Runtime(e) => write!(f, "runtime: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Tls(e) => Some(e),
            ServerError::Bind(_, e) | ServerError::Runtime(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<TlsConfigError> for ServerError {
    fn from(e: TlsConfigError) -> Self {
        ServerError::Tls(e)
    }
}
