//! Response heads and body framing.

use bytes::{BufMut, BytesMut};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};
use std::time::Duration;

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body may follow (HEAD, 1xx, 204, 304).
    None,
    Length(u64),
    Chunked,
    /// HTTP/1.0 peer and unknown length: the body ends at close.
    Close,
}

impl Framing {
    /// Pick framing for a response.
    pub fn choose(method: &Method, status: StatusCode, version: Version, len: Option<u64>) -> Self {
        if *method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Framing::None;
        }
        match len {
            Some(len) => Framing::Length(len),
            None if version == Version::HTTP_11 => Framing::Chunked,
            None => Framing::Close,
        }
    }

    /// Whether the connection can carry another response afterwards.
    pub fn reusable(self) -> bool {
        self != Framing::Close
    }
}

/// Connection-management headers the engine owns.
pub struct Persistence {
    pub keep_alive: bool,
    pub version: Version,
    pub timeout: Duration,
}

/// Encode the status line and headers.
///
/// `headers` is completed with `Date`, framing, and `Connection` /
/// `Keep-Alive` headers; application values for those are replaced.
pub fn encode_head(
    status: StatusCode,
    headers: &mut HeaderMap,
    framing: Framing,
    body_len: Option<u64>,
    persistence: &Persistence,
    dst: &mut BytesMut,
) {
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove("keep-alive");
    if !headers.contains_key(header::DATE) {
        if let Ok(date) = HeaderValue::try_from(http_date()) {
            headers.insert(header::DATE, date);
        }
    }
    match framing {
        Framing::Length(len) => {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        Framing::Chunked => {
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        Framing::Close => {
            headers.remove(header::CONTENT_LENGTH);
        }
        Framing::None => {
            // HEAD answers advertise the length a GET would have
            if let Some(len) = body_len.filter(|_| status != StatusCode::NO_CONTENT) {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        if persistence.keep_alive {
            if persistence.version == Version::HTTP_10 {
                headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            } else {
                headers.remove(header::CONNECTION);
            }
            let timeout = format!("timeout={}", persistence.timeout.as_secs());
            if let Ok(value) = HeaderValue::try_from(timeout) {
                headers.insert("keep-alive", value);
            }
        } else {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
    }

    write_status_line(status, dst);
    write_headers(headers, dst);
}

/// Encode a head as-is, for 100 Continue and 101 responses.
pub fn encode_raw_head(status: StatusCode, headers: &HeaderMap, dst: &mut BytesMut) {
    write_status_line(status, dst);
    write_headers(headers, dst);
}

fn write_status_line(status: StatusCode, dst: &mut BytesMut) {
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(status.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    dst.put_slice(b"\r\n");
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

/// Frame one body chunk. Empty chunks are skipped since a zero-size chunk
/// ends a chunked body.
pub fn encode_chunk(framing: Framing, data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    if framing == Framing::Chunked {
        dst.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
        dst.put_slice(data);
        dst.put_slice(b"\r\n");
    } else {
        dst.put_slice(data);
    }
}

/// Terminate the body.
pub fn encode_end(framing: Framing, dst: &mut BytesMut) {
    if framing == Framing::Chunked {
        dst.put_slice(b"0\r\n\r\n");
    }
}

/// A short response for requests that never reach the application.
pub fn encode_error(status: StatusCode, dst: &mut BytesMut) {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    let persistence = Persistence {
        keep_alive: false,
        version: Version::HTTP_11,
        timeout: Duration::ZERO,
    };
    let len = reason.len() as u64;
    encode_head(
        status,
        &mut headers,
        Framing::Length(len),
        Some(len),
        &persistence,
        dst,
    );
    dst.put_slice(reason.as_bytes());
}

/// IMF-fixdate, as required for the `Date` header.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
