//! WebSocket HTTP upgrade handling.
//!
//! Implements the server side of the RFC 6455 opening handshake on top of a
//! parsed HTTP/1.1 request.

use super::deflate::{self, DeflateConfig};
use crate::service::{Body, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};
use sha1::{Digest, Sha1};

/// WebSocket magic GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const WS_VERSION: &str = "13";

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Malformed upgrade; answered with 400.
    Invalid(&'static str),
    /// Version other than 13; answered with 426.
    UnsupportedVersion,
}

impl HandshakeError {
    /// Response sent instead of `101 Switching Protocols`.
    pub fn response(&self) -> Response {
        let mut response = http::Response::new(Body::Empty);
        match self {
            HandshakeError::Invalid(_) => {
                *response.status_mut() = StatusCode::BAD_REQUEST;
            }
            HandshakeError::UnsupportedVersion => {
                *response.status_mut() = StatusCode::UPGRADE_REQUIRED;
                response.headers_mut().insert(
                    header::SEC_WEBSOCKET_VERSION,
                    HeaderValue::from_static(WS_VERSION),
                );
            }
        }
        response
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Invalid(reason) => write!(f, "invalid websocket upgrade: {reason}"),
            HandshakeError::UnsupportedVersion => write!(f, "unsupported websocket version"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshake {
    /// Sec-WebSocket-Key as sent.
    pub key: String,
    /// Offered subprotocols in preference order.
    pub protocols: Vec<String>,
    /// Raw Sec-WebSocket-Extensions offers.
    pub extensions: Option<String>,
}

impl ClientHandshake {
    /// Validate the upgrade headers of a GET request.
    pub fn validate(
        method: &Method,
        version: Version,
        headers: &HeaderMap,
    ) -> Result<Self, HandshakeError> {
        if *method != Method::GET {
            return Err(HandshakeError::Invalid("method must be GET"));
        }
        if version != Version::HTTP_11 {
            return Err(HandshakeError::Invalid("HTTP/1.1 required"));
        }

        let ws_version = headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);
        if ws_version != Some(WS_VERSION) {
            return Err(HandshakeError::UnsupportedVersion);
        }

        let key = headers
            .get(header::SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .ok_or(HandshakeError::Invalid("missing Sec-WebSocket-Key"))?;
        // Key should be 16 bytes base64 encoded (24 chars with padding)
        match STANDARD.decode(key) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::Invalid("malformed Sec-WebSocket-Key")),
        }

        let protocols = headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let extensions: Vec<&str> = headers
            .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let extensions = if extensions.is_empty() {
            None
        } else {
            Some(extensions.join(", "))
        };

        Ok(Self {
            key: key.to_string(),
            protocols,
            extensions,
        })
    }

    /// Negotiate permessage-deflate from the client's offers.
    pub fn negotiate_deflate(&self, enabled: bool) -> Option<DeflateConfig> {
        if !enabled {
            return None;
        }
        self.extensions.as_deref().and_then(deflate::negotiate)
    }

    /// Build the `101 Switching Protocols` response.
    ///
    /// `subprotocol` must be one of the offered protocols; anything else is
    /// dropped so the client is never handed a protocol it did not ask for.
    pub fn accept(&self, subprotocol: Option<&str>, deflate: Option<&DeflateConfig>) -> Response {
        let mut response = http::Response::new(Body::Empty);
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(value) = HeaderValue::try_from(accept_key(&self.key)) {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
        }
        if let Some(protocol) = subprotocol.filter(|p| self.protocols.iter().any(|o| o == p)) {
            if let Ok(value) = HeaderValue::try_from(protocol) {
                headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        }
        if let Some(config) = deflate {
            if let Ok(value) = HeaderValue::try_from(config.response_header()) {
                headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, value);
            }
        }
        response
    }
}

/// Compute Sec-WebSocket-Accept for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}
