//! Request body decoding.

use super::parser::BodyFraming;
use super::Http1Error;
use bytes::{Buf, BytesMut};

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4096;

/// Incremental body decoder. Bytes are taken from the connection buffer as
/// they become available, so a body never absorbs the next request.
#[derive(Debug)]
pub enum BodyDecoder {
    Length { remaining: u64 },
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
    Done,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Length(len) => BodyDecoder::Length { remaining: len },
            BodyFraming::Chunked => BodyDecoder::Chunked(ChunkState::Size),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            BodyDecoder::Length { remaining: 0 } | BodyDecoder::Chunked(ChunkState::Done)
        )
    }

    /// Move body bytes from `src` to `dst`. Returns true once the body is
    /// complete; false means more input is needed.
    pub fn decode(
        &mut self,
        src: &mut BytesMut,
        dst: &mut BytesMut,
        limit: usize,
    ) -> Result<bool, Http1Error> {
        match self {
            BodyDecoder::Length { remaining } => {
                let n = (*remaining).min(src.len() as u64) as usize;
                if dst.len() + n > limit {
                    return Err(Http1Error::BodyTooLarge);
                }
                dst.extend_from_slice(&src[..n]);
                src.advance(n);
                *remaining -= n as u64;
                Ok(*remaining == 0)
            }
            BodyDecoder::Chunked(state) => decode_chunked(state, src, dst, limit),
        }
    }
}

fn decode_chunked(
    state: &mut ChunkState,
    src: &mut BytesMut,
    dst: &mut BytesMut,
    limit: usize,
) -> Result<bool, Http1Error> {
    loop {
        match *state {
            ChunkState::Size => {
                let Some(line) = take_line(src)? else {
                    return Ok(false);
                };
                let size = line[..].split(|b| *b == b';').next().unwrap_or_default();
                let size = std::str::from_utf8(size)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                    .ok_or(Http1Error::Malformed("invalid chunk size"))?;
                if dst.len() as u64 + size > limit as u64 {
                    return Err(Http1Error::BodyTooLarge);
                }
                *state = if size == 0 {
                    ChunkState::Trailers
                } else {
                    ChunkState::Data { remaining: size }
                };
            }
            ChunkState::Data { remaining } => {
                if src.is_empty() {
                    return Ok(false);
                }
                let n = remaining.min(src.len() as u64) as usize;
                dst.extend_from_slice(&src[..n]);
                src.advance(n);
                let remaining = remaining - n as u64;
                *state = if remaining == 0 {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data { remaining }
                };
            }
            ChunkState::DataEnd => {
                if src.len() < 2 {
                    return Ok(false);
                }
                if &src[..2] != b"\r\n" {
                    return Err(Http1Error::Malformed("chunk not terminated by CRLF"));
                }
                src.advance(2);
                *state = ChunkState::Size;
            }
            ChunkState::Trailers => {
                // trailers are read and dropped
                let Some(line) = take_line(src)? else {
                    return Ok(false);
                };
                if line.is_empty() {
                    *state = ChunkState::Done;
                }
            }
            ChunkState::Done => return Ok(true),
        }
    }
}

/// Split one CRLF-terminated line off `src`, without the terminator.
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, Http1Error> {
    match src.windows(2).position(|w| w == b"\r\n") {
        Some(pos) if pos > MAX_LINE => Err(Http1Error::Malformed("chunk line too long")),
        Some(pos) => {
            let line = src.split_to(pos);
            src.advance(2);
            Ok(Some(line))
        }
        None if src.len() > MAX_LINE => Err(Http1Error::Malformed("chunk line too long")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_body_leaves_next_request() {
        let mut decoder = BodyDecoder::new(BodyFraming::Length(5));
        let mut src = BytesMut::from(&b"helloGET /"[..]);
        let mut body = BytesMut::new();
        assert!(decoder.decode(&mut src, &mut body, 1024).unwrap());
        assert_eq!(&body[..], b"hello");
        assert_eq!(&src[..], b"GET /");
    }

    #[test]
    fn test_chunked_incremental() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut body = BytesMut::new();
        let mut src = BytesMut::from(&b"5;ext=1\r\nhel"[..]);
        assert!(!decoder.decode(&mut src, &mut body, 1024).unwrap());
        src.extend_from_slice(b"lo\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nnext");
        assert!(decoder.decode(&mut src, &mut body, 1024).unwrap());
        assert!(decoder.is_done());
        assert_eq!(&body[..], b"hello world");
        assert_eq!(&src[..], b"next");
    }

    #[test]
    fn test_chunked_errors() {
        let mut body = BytesMut::new();
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut src = BytesMut::from(&b"zz\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut src, &mut body, 1024),
            Err(Http1Error::Malformed(_))
        ));

        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut src = BytesMut::from(&b"400\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut src, &mut body, 16),
            Err(Http1Error::BodyTooLarge)
        );

        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut src = BytesMut::from(&b"2\r\nabXY"[..]);
        assert!(matches!(
            decoder.decode(&mut src, &mut body, 1024),
            Err(Http1Error::Malformed(_))
        ));
    }
}
