//! HTTP/1.1 connections.
//!
//! - `parser`: request heads over `httparse`
//! - `body`: Content-Length and chunked request bodies
//! - `response`: response heads and body framing
//! - `conn`: socket-independent connection state and keep-alive policy
//! - `blocking` / `nonblocking`: drivers for worker threads and the event
//!   loop
//!
//! A driver returns a [`Handoff`] when the connection leaves HTTP/1.1, so
//! the caller can continue it as HTTP/2 or WebSocket.

pub mod blocking;
pub mod body;
pub mod conn;
pub mod nonblocking;
pub mod parser;
pub mod response;

pub use conn::{Http1Conn, Http1State, ParsedRequest, Progress};

use crate::protocols::dispatch::Upgrade;
use crate::protocols::http2::H2cUpgrade;
use crate::protocols::websocket::deflate::DeflateConfig;
use crate::protocols::websocket::handshake::ClientHandshake;
use crate::protocols::websocket::WebSocketView;
use crate::protocols::ServeContext;
use crate::runtime::TaskError;
use crate::service::{Body, Request, Response};
use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};
use response::{Framing, Persistence};
use tracing::{debug, warn};

/// Interim response for `Expect: 100-continue`.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const READ_CHUNK: usize = 16 * 1024;

/// Why a request could not be read. Each maps to the status sent before
/// the connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http1Error {
    Malformed(&'static str),
    HeadersTooLarge,
    BodyTooLarge,
    UnsupportedTransferCoding,
    UnsupportedVersion,
    /// The request did not arrive within the read timeout.
    Timeout,
}

impl Http1Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Http1Error::Malformed(_) => StatusCode::BAD_REQUEST,
            Http1Error::HeadersTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Http1Error::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Http1Error::UnsupportedTransferCoding => StatusCode::NOT_IMPLEMENTED,
            Http1Error::UnsupportedVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            Http1Error::Timeout => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl std::fmt::Display for Http1Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Http1Error::Malformed(reason) => write!(f, "malformed request: {reason}"),
            Http1Error::HeadersTooLarge => write!(f, "request head too large"),
            Http1Error::BodyTooLarge => write!(f, "request body too large"),
            Http1Error::UnsupportedTransferCoding => write!(f, "unsupported transfer coding"),
            Http1Error::UnsupportedVersion => write!(f, "unsupported HTTP version"),
            Http1Error::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for Http1Error {}

/// How an HTTP/1.1 connection ended.
pub enum Handoff<S> {
    Closed,
    /// Continue as HTTP/2: after the preface, or after `101` for h2c.
    Http2 {
        io: S,
        buffered: Bytes,
        upgrade: Option<H2cUpgrade>,
    },
    /// Continue as WebSocket after `101`.
    WebSocket {
        io: S,
        buffered: Bytes,
        view: Box<dyn WebSocketView>,
        deflate: Option<DeflateConfig>,
    },
}

impl<S> Handoff<S> {
    /// Swap the socket, keeping everything else.
    pub fn try_map_io<T, E>(self, f: impl FnOnce(S) -> Result<T, E>) -> Result<Handoff<T>, E> {
        Ok(match self {
            Handoff::Closed => Handoff::Closed,
            Handoff::Http2 {
                io,
                buffered,
                upgrade,
            } => Handoff::Http2 {
                io: f(io)?,
                buffered,
                upgrade,
            },
            Handoff::WebSocket {
                io,
                buffered,
                view,
                deflate,
            } => Handoff::WebSocket {
                io: f(io)?,
                buffered,
                view,
                deflate,
            },
        })
    }
}

impl<S> std::fmt::Debug for Handoff<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handoff::Closed => write!(f, "Handoff::Closed"),
            Handoff::Http2 { upgrade, .. } => {
                write!(f, "Handoff::Http2 {{ upgrade: {} }}", upgrade.is_some())
            }
            Handoff::WebSocket { deflate, .. } => {
                write!(f, "Handoff::WebSocket {{ deflate: {deflate:?} }}")
            }
        }
    }
}

/// What to do with a complete request.
enum Route {
    Serve { request: Request, keep_alive: bool },
    /// Write `head`, then switch protocols.
    H2c { head: BytesMut, upgrade: H2cUpgrade },
    WebSocket {
        head: BytesMut,
        view: Box<dyn WebSocketView>,
        deflate: Option<DeflateConfig>,
    },
    /// Write `head` and close.
    Reject { head: BytesMut },
}

fn route(parsed: ParsedRequest, ctx: &ServeContext) -> Route {
    let ParsedRequest {
        request,
        keep_alive,
        upgrade,
    } = parsed;
    match upgrade {
        Upgrade::None => Route::Serve {
            request,
            keep_alive,
        },
        Upgrade::H2c { settings } => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
            let mut head = BytesMut::new();
            response::encode_raw_head(StatusCode::SWITCHING_PROTOCOLS, &headers, &mut head);
            Route::H2c {
                head,
                upgrade: H2cUpgrade { request, settings },
            }
        }
        Upgrade::WebSocket => {
            let handshake =
                match ClientHandshake::validate(request.method(), request.version(), request.headers())
                {
                    Ok(handshake) => handshake,
                    Err(e) => {
                        debug!(error = %e, "Rejecting WebSocket upgrade");
                        let rejection = e.response();
                        let mut headers = rejection.headers().clone();
                        let mut head = BytesMut::new();
                        response::encode_head(
                            rejection.status(),
                            &mut headers,
                            Framing::Length(0),
                            Some(0),
                            &closing(),
                            &mut head,
                        );
                        return Route::Reject { head };
                    }
                };
            let Some(view) = ctx.service.websocket(&request) else {
                // the application serves this URL as plain HTTP
                return Route::Serve {
                    request,
                    keep_alive,
                };
            };
            let subprotocol = view.subprotocol(&handshake.protocols);
            let deflate = handshake.negotiate_deflate(ctx.config.websocket.permessage_deflate);
            let accept = handshake.accept(subprotocol.as_deref(), deflate.as_ref());
            let mut head = BytesMut::new();
            response::encode_raw_head(accept.status(), accept.headers(), &mut head);
            Route::WebSocket {
                head,
                view,
                deflate,
            }
        }
    }
}

fn closing() -> Persistence {
    Persistence {
        keep_alive: false,
        version: Version::HTTP_11,
        timeout: std::time::Duration::ZERO,
    }
}

/// The request side of one exchange, kept while the handler runs.
struct Exchange {
    method: Method,
    version: Version,
    /// The client allows the connection to persist.
    keep_alive: bool,
}

impl Exchange {
    fn new(request: &Request, keep_alive: bool) -> Self {
        Self {
            method: request.method().clone(),
            version: request.version(),
            keep_alive,
        }
    }
}

/// A response ready to be written.
struct Outgoing {
    head: BytesMut,
    framing: Framing,
    body: Body,
    keep_alive: bool,
}

/// Settle framing and persistence and encode the head.
fn prepare_response(
    conn: &Http1Conn,
    response: Response,
    exchange: &Exchange,
    under_pressure: bool,
    shutting_down: bool,
    keepalive_timeout: std::time::Duration,
) -> Outgoing {
    let (mut parts, body) = response.into_parts();
    let len = body.len();
    let framing = Framing::choose(&exchange.method, parts.status, exchange.version, len);
    let keep_alive = framing.reusable()
        && conn.keep_alive(
            exchange.keep_alive,
            &parts.headers,
            under_pressure,
            shutting_down,
        );
    let persistence = Persistence {
        keep_alive,
        version: exchange.version,
        timeout: keepalive_timeout,
    };
    let mut head = BytesMut::with_capacity(256);
    response::encode_head(
        parts.status,
        &mut parts.headers,
        framing,
        len,
        &persistence,
        &mut head,
    );
    Outgoing {
        head,
        framing,
        body,
        keep_alive,
    }
}

/// Response for a handler that did not produce one.
fn task_error_response(error: &TaskError) -> Response {
    warn!(error = %error, "Request handler failed");
    let status = match error {
        TaskError::Rejected => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = Response::new(Body::from(status.canonical_reason().unwrap_or("Error")));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Tracks bytes written against a declared Content-Length.
struct LengthCheck {
    framing: Framing,
    written: u64,
}

impl LengthCheck {
    fn new(framing: Framing) -> Self {
        Self {
            framing,
            written: 0,
        }
    }

    /// Trim `chunk` to what the framing still allows.
    fn admit<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        let allowed = match self.framing {
            Framing::Length(len) => (len - self.written).min(chunk.len() as u64) as usize,
            _ => chunk.len(),
        };
        self.written += allowed as u64;
        &chunk[..allowed]
    }

    /// A sized body must deliver exactly its length.
    fn finish(&self) -> Result<(), crate::error::ConnectionError> {
        match self.framing {
            Framing::Length(expected) if expected != self.written => {
                Err(crate::error::ConnectionError::BodyLength {
                    expected,
                    written: self.written,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_statuses() {
        assert_eq!(Http1Error::Malformed("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Http1Error::UnsupportedTransferCoding.status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(Http1Error::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_length_check() {
        let mut check = LengthCheck::new(Framing::Length(5));
        assert_eq!(check.admit(b"abc"), b"abc");
        assert_eq!(check.admit(b"defg"), b"de");
        assert!(check.finish().is_ok());

        let mut short = LengthCheck::new(Framing::Length(5));
        short.admit(b"ab");
        assert!(short.finish().is_err());
    }
}
