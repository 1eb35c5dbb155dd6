//! Protocol selection.
//!
//! Decisions happen at three points:
//! - after the TLS handshake, from the ALPN result
//! - on the first bytes of a cleartext connection, by sniffing the HTTP/2
//!   connection preface
//! - per HTTP/1.1 request, by inspecting upgrade headers

use crate::transport::tls::ALPN_H2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName};
use http::{Method, Version};

/// Client connection preface for HTTP/2.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    WebSocket,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "http/1.1"),
            Protocol::Http2 => write!(f, "h2"),
            Protocol::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Where a fresh connection starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// ALPN selected `h2`; the client preface follows immediately.
    Http2,
    /// Start with HTTP/1.1. `h2c` allows the cleartext upgrade paths.
    Http1 { h2c: bool },
}

/// Pick the entry protocol from the negotiated ALPN value.
///
/// ALPN is authoritative when present; without it the connection is
/// cleartext (or the client skipped ALPN) and HTTP/2 must be discovered.
pub fn select_entry(alpn: Option<&[u8]>, tls: bool, http2_enabled: bool) -> Entry {
    match alpn {
        Some(proto) if proto == ALPN_H2 && http2_enabled => Entry::Http2,
        Some(_) => Entry::Http1 { h2c: false },
        None => Entry::Http1 {
            h2c: http2_enabled && !tls,
        },
    }
}

/// Result of looking at the first bytes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// The full HTTP/2 preface is present.
    Http2Preface,
    /// Cannot be the preface.
    Http1,
    /// Consistent with the preface so far.
    NeedMore,
}

pub fn sniff_preface(buf: &[u8]) -> Sniff {
    let n = buf.len().min(H2_PREFACE.len());
    if buf[..n] != H2_PREFACE[..n] {
        Sniff::Http1
    } else if n == H2_PREFACE.len() {
        Sniff::Http2Preface
    } else {
        Sniff::NeedMore
    }
}

/// Upgrade requested by an HTTP/1.1 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upgrade {
    None,
    /// `Upgrade: h2c` with decoded HTTP2-Settings payload.
    H2c { settings: Bytes },
    /// `Upgrade: websocket`; the handshake still has to be validated.
    WebSocket,
}

/// Inspect a request head for an upgrade the engine understands.
pub fn classify_upgrade(
    method: &Method,
    version: Version,
    headers: &HeaderMap,
    h2c_allowed: bool,
) -> Upgrade {
    if version != Version::HTTP_11 || !has_token(headers, &header::CONNECTION, "upgrade") {
        return Upgrade::None;
    }
    if has_token(headers, &header::UPGRADE, "websocket") && *method == Method::GET {
        return Upgrade::WebSocket;
    }
    if h2c_allowed
        && has_token(headers, &header::UPGRADE, "h2c")
        && has_token(headers, &header::CONNECTION, "http2-settings")
    {
        let mut values = headers.get_all("http2-settings").iter();
        if let (Some(value), None) = (values.next(), values.next()) {
            let decoded = value.to_str().map(|v| URL_SAFE_NO_PAD.decode(v.trim()));
            if let Ok(Ok(settings)) = decoded {
                return Upgrade::H2c {
                    settings: Bytes::from(settings),
                };
            }
        }
    }
    Upgrade::None
}

/// Case-insensitive search of a comma-separated header list.
pub fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}
