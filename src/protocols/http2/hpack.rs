//! Header blocks.
//!
//! `fluke-hpack` does the HPACK coding; this module maps decoded fields to
//! request heads (pseudo-header and connection-header rules of RFC 9113
//! section 8) and response heads to fields.

use super::{ErrorCode, H2Error, H2Result};
use bytes::Bytes;
use fluke_hpack::{Decoder, Encoder};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Method, StatusCode, Uri, Version};

/// Decoded header list as name/value pairs.
pub type Fields = Vec<(Vec<u8>, Vec<u8>)>;

/// Default SETTINGS_HEADER_TABLE_SIZE, which the encoder assumes.
const DEFAULT_TABLE_SIZE: u32 = 4096;

/// Per-field overhead counted against the header list size.
const FIELD_OVERHEAD: usize = 32;

/// Why a header block cannot become a request. These are stream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// Broken pseudo-headers or forbidden fields: RST_STREAM PROTOCOL_ERROR.
    Malformed(&'static str),
    /// Header list over the configured limit: answered with 431.
    TooLarge,
}

pub struct HeaderDecoder {
    decoder: Decoder<'static>,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self {
            decoder: Decoder::new(),
        }
    }

    /// Decode one complete block. Failure corrupts the shared table, so it
    /// is a connection error.
    pub fn decode(&mut self, block: &[u8]) -> H2Result<Fields> {
        self.decoder.decode(block).map_err(|e| {
            tracing::debug!(error = ?e, "HPACK decoding failed");
            H2Error::with_code(ErrorCode::COMPRESSION_ERROR, "invalid header block")
        })
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HeaderEncoder {
    encoder: Encoder<'static>,
    /// Cleared when the peer shrinks its table below the default; from then
    /// on fields are sent as literals that never touch the dynamic table.
    indexing: bool,
    size_update_due: bool,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        Self {
            encoder: Encoder::new(),
            indexing: true,
            size_update_due: false,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_peer_table_size(&mut self, size: u32) {
        if size < DEFAULT_TABLE_SIZE && self.indexing {
            self.indexing = false;
            self.size_update_due = true;
        }
    }

    /// Encode a response head. Connection-specific headers are dropped.
    pub fn encode_response(&mut self, status: StatusCode, headers: &HeaderMap) -> Bytes {
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(headers.len() + 1);
        fields.push((&b":status"[..], status.as_str().as_bytes()));
        for (name, value) in headers {
            if !is_connection_specific(name) {
                fields.push((name.as_str().as_bytes(), value.as_bytes()));
            }
        }

        if self.indexing {
            return Bytes::from(self.encoder.encode(fields));
        }
        let mut block = Vec::new();
        if self.size_update_due {
            // dynamic table size update to zero
            encode_integer(0, 5, 0x20, &mut block);
            self.size_update_due = false;
        }
        for (name, value) in fields {
            block.push(0x00);
            encode_integer(name.len(), 7, 0, &mut block);
            block.extend_from_slice(name);
            encode_integer(value.len(), 7, 0, &mut block);
            block.extend_from_slice(value);
        }
        Bytes::from(block)
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// HPACK prefixed integer (RFC 7541 section 5.1).
fn encode_integer(value: usize, prefix_bits: u8, first: u8, dst: &mut Vec<u8>) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.push(first | value as u8);
        return;
    }
    dst.push(first | max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        dst.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    dst.push(rest as u8);
}

fn is_connection_specific(name: &HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// Build a request head from a decoded HEADERS block.
pub fn request_head(fields: Fields, max_header_bytes: usize) -> Result<Parts, HeaderError> {
    let size: usize = fields
        .iter()
        .map(|(name, value)| name.len() + value.len() + FIELD_OVERHEAD)
        .sum();
    if size > max_header_bytes {
        return Err(HeaderError::TooLarge);
    }

    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = HeaderMap::with_capacity(fields.len());
    let mut regular_seen = false;

    for (name, value) in fields {
        if let Some(pseudo) = name.strip_prefix(b":") {
            if regular_seen {
                return Err(HeaderError::Malformed("pseudo-header after regular header"));
            }
            let slot = match pseudo {
                b"method" => &mut method,
                b"scheme" => &mut scheme,
                b"authority" => &mut authority,
                b"path" => &mut path,
                _ => return Err(HeaderError::Malformed("unknown pseudo-header")),
            };
            if slot.replace(value).is_some() {
                return Err(HeaderError::Malformed("duplicate pseudo-header"));
            }
            continue;
        }

        regular_seen = true;
        if name.iter().any(u8::is_ascii_uppercase) {
            return Err(HeaderError::Malformed("uppercase header name"));
        }
        let name = HeaderName::from_bytes(&name)
            .map_err(|_| HeaderError::Malformed("invalid header name"))?;
        if is_connection_specific(&name) {
            return Err(HeaderError::Malformed("connection-specific header"));
        }
        if name == header::TE && value != b"trailers" {
            return Err(HeaderError::Malformed("TE other than trailers"));
        }
        let value = HeaderValue::from_bytes(&value)
            .map_err(|_| HeaderError::Malformed("invalid header value"))?;
        headers.append(name, value);
    }

    let method = method.ok_or(HeaderError::Malformed("missing :method"))?;
    let method =
        Method::from_bytes(&method).map_err(|_| HeaderError::Malformed("invalid :method"))?;

    let uri = if method == Method::CONNECT {
        if scheme.is_some() || path.is_some() {
            return Err(HeaderError::Malformed("CONNECT with :scheme or :path"));
        }
        let authority = authority
            .as_deref()
            .ok_or(HeaderError::Malformed("CONNECT without :authority"))?;
        Uri::try_from(authority).map_err(|_| HeaderError::Malformed("invalid :authority"))?
    } else {
        let scheme = scheme.ok_or(HeaderError::Malformed("missing :scheme"))?;
        let path = path
            .filter(|p| !p.is_empty())
            .ok_or(HeaderError::Malformed("missing :path"))?;
        let mut builder = Uri::builder();
        if let Some(authority) = &authority {
            builder = builder.scheme(scheme.as_slice()).authority(authority.as_slice());
        }
        builder
            .path_and_query(path.as_slice())
            .build()
            .map_err(|_| HeaderError::Malformed("invalid request target"))?
    };

    if let Some(authority) = authority {
        if !headers.contains_key(header::HOST) {
            let value = HeaderValue::from_bytes(&authority)
                .map_err(|_| HeaderError::Malformed("invalid :authority"))?;
            headers.insert(header::HOST, value);
        }
    }

    let (mut parts, ()) = http::Request::new(()).into_parts();
    parts.method = method;
    parts.uri = uri;
    parts.version = Version::HTTP_2;
    parts.headers = headers;
    Ok(parts)
}

/// Trailers may not carry pseudo-headers.
pub fn check_trailers(fields: &Fields) -> Result<(), HeaderError> {
    if fields.iter().any(|(name, _)| name.starts_with(b":")) {
        return Err(HeaderError::Malformed("pseudo-header in trailers"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(fields: &[(&str, &str)]) -> Vec<u8> {
        Encoder::new().encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())))
    }

    fn head(fields: &[(&str, &str)]) -> Result<Parts, HeaderError> {
        let mut decoder = HeaderDecoder::new();
        request_head(decoder.decode(&block(fields)).unwrap(), 16_384)
    }

    #[test]
    fn test_request_head() {
        let parts = head(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":authority", "example.com"),
            (":path", "/index?x=1"),
            ("accept", "*/*"),
        ])
        .unwrap();
        assert_eq!(parts.method, Method::GET);
        assert_eq!(parts.uri.path(), "/index");
        assert_eq!(parts.uri.query(), Some("x=1"));
        assert_eq!(parts.version, Version::HTTP_2);
        assert_eq!(parts.headers[header::HOST], "example.com");
        assert_eq!(parts.headers[header::ACCEPT], "*/*");
    }

    #[test]
    fn test_malformed_requests() {
        let missing_path = head(&[(":method", "GET"), (":scheme", "http")]);
        assert_eq!(missing_path.unwrap_err(), HeaderError::Malformed("missing :path"));

        let late_pseudo = head(&[
            (":method", "GET"),
            ("accept", "*/*"),
            (":scheme", "http"),
            (":path", "/"),
        ]);
        assert!(matches!(late_pseudo, Err(HeaderError::Malformed(_))));

        let connection = head(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            ("connection", "keep-alive"),
        ]);
        assert!(matches!(connection, Err(HeaderError::Malformed(_))));

        let te = head(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            ("te", "gzip"),
        ]);
        assert!(matches!(te, Err(HeaderError::Malformed(_))));
    }

    #[test]
    fn test_header_list_limit() {
        let mut decoder = HeaderDecoder::new();
        let long = "v".repeat(200);
        let fields = decoder
            .decode(&block(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                ("x", long.as_str()),
            ]))
            .unwrap();
        assert_eq!(request_head(fields, 128).unwrap_err(), HeaderError::TooLarge);
    }

    #[test]
    fn test_garbage_block_is_compression_error() {
        let mut decoder = HeaderDecoder::new();
        // indexed field far past the static table
        assert!(matches!(
            decoder.decode(&[0xff, 0xff, 0xff, 0x7f]),
            Err(H2Error::Protocol {
                code: ErrorCode::COMPRESSION_ERROR,
                ..
            })
        ));
    }

    #[test]
    fn test_response_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));

        for shrink in [false, true] {
            let mut encoder = HeaderEncoder::new();
            if shrink {
                encoder.set_peer_table_size(0);
            }
            let block = encoder.encode_response(StatusCode::NOT_FOUND, &headers);
            let fields = Decoder::new().decode(&block).unwrap();
            assert_eq!(
                fields,
                vec![
                    (b":status".to_vec(), b"404".to_vec()),
                    (b"content-type".to_vec(), b"text/plain".to_vec()),
                ]
            );
        }
    }

    #[test]
    fn test_integer_encoding() {
        // RFC 7541 C.1.2: 1337 with a 5-bit prefix
        let mut out = Vec::new();
        encode_integer(1337, 5, 0, &mut out);
        assert_eq!(out, vec![0x1f, 0x9a, 0x0a]);
    }
}
