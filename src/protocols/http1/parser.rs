//! Request head parsing over `httparse`.

use super::Http1Error;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Method, Uri, Version};

/// httparse needs the header array preallocated.
pub const MAX_HEADERS: usize = 100;

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
}

/// A parsed request line and headers.
#[derive(Debug)]
pub struct RequestHead {
    pub parts: Parts,
    pub framing: BodyFraming,
    /// `Expect: 100-continue` was sent.
    pub expect_continue: bool,
}

/// Parse a request head from the front of `buf`.
///
/// Returns the head and the number of bytes it occupied, or `None` when more
/// input is needed. Heads longer than `max_header_bytes` are rejected.
pub fn parse_head(
    buf: &[u8],
    max_header_bytes: usize,
    max_request_bytes: usize,
) -> Result<Option<(RequestHead, usize)>, Http1Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > max_header_bytes => {
            return Err(Http1Error::HeadersTooLarge)
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(Http1Error::HeadersTooLarge),
        Err(httparse::Error::Version) => return Err(Http1Error::UnsupportedVersion),
        Err(e) => {
            tracing::debug!(error = %e, "Malformed request head");
            return Err(Http1Error::Malformed("malformed request head"));
        }
    };
    if len > max_header_bytes {
        return Err(Http1Error::HeadersTooLarge);
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(Http1Error::Malformed("invalid method"))?;
    let uri = req
        .path
        .and_then(|p| Uri::try_from(p).ok())
        .ok_or(Http1Error::Malformed("invalid request target"))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Http1Error::UnsupportedVersion),
    };

    let mut map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| Http1Error::Malformed("invalid header name"))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| Http1Error::Malformed("invalid header value"))?;
        map.append(name, value);
    }

    let framing = body_framing(&map, max_request_bytes)?;
    let expect_continue = version == Version::HTTP_11
        && map
            .get(header::EXPECT)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));

    let (mut parts, ()) = http::Request::new(()).into_parts();
    parts.method = method;
    parts.uri = uri;
    parts.version = version;
    parts.headers = map;
    Ok(Some((
        RequestHead {
            parts,
            framing,
            expect_continue,
        },
        len,
    )))
}

/// Work out body framing (RFC 9112 section 6.3).
fn body_framing(headers: &HeaderMap, max_request_bytes: usize) -> Result<BodyFraming, Http1Error> {
    let has_te = headers.contains_key(header::TRANSFER_ENCODING);
    let has_cl = headers.contains_key(header::CONTENT_LENGTH);
    if has_te && has_cl {
        return Err(Http1Error::Malformed(
            "both Content-Length and Transfer-Encoding",
        ));
    }

    if has_te {
        let codings: Vec<String> = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        return match codings.as_slice() {
            [only] if only == "chunked" => Ok(BodyFraming::Chunked),
            _ => Err(Http1Error::UnsupportedTransferCoding),
        };
    }

    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(Http1Error::Malformed("invalid Content-Length"))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(Http1Error::Malformed("conflicting Content-Length"))
            }
            _ => length = Some(parsed),
        }
    }
    let length = length.unwrap_or(0);
    if length > max_request_bytes as u64 {
        return Err(Http1Error::BodyTooLarge);
    }
    Ok(BodyFraming::Length(length))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Option<(RequestHead, usize)>, Http1Error> {
        parse_head(raw.as_bytes(), 8192, 1024)
    }

    #[test]
    fn test_parse_get() {
        let raw = "GET /path?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\nextra";
        let (head, len) = parse(raw).unwrap().unwrap();
        assert_eq!(len, raw.len() - "extra".len());
        assert_eq!(head.parts.method, Method::GET);
        assert_eq!(head.parts.uri.path(), "/path");
        assert_eq!(head.parts.version, Version::HTTP_11);
        assert_eq!(head.parts.headers[header::HOST], "example.com");
        assert_eq!(head.framing, BodyFraming::Length(0));
        assert!(!head.expect_continue);
    }

    #[test]
    fn test_partial_head() {
        assert!(parse("GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        let long = format!("GET / HTTP/1.1\r\nX: {}\r\n", "a".repeat(9000));
        assert_eq!(parse(&long).unwrap_err(), Http1Error::HeadersTooLarge);
    }

    #[test]
    fn test_body_framing() {
        let (head, _) = parse("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.framing, BodyFraming::Length(5));

        let (head, _) = parse("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.framing, BodyFraming::Chunked);

        let both = parse(
            "POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(both, Err(Http1Error::Malformed(_))));

        let gzip = parse("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n");
        assert_eq!(gzip.unwrap_err(), Http1Error::UnsupportedTransferCoding);

        let big = parse("POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n");
        assert_eq!(big.unwrap_err(), Http1Error::BodyTooLarge);
    }

    #[test]
    fn test_expect_continue() {
        let (head, _) = parse(
            "PUT /upload HTTP/1.1\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(head.expect_continue);
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nBad Header\r\n\r\n"),
            Err(Http1Error::Malformed(_))
        ));
        assert_eq!(
            parse("GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            Http1Error::UnsupportedVersion
        );
    }
}
