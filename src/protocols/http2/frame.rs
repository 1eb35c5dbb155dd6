//! HTTP/2 frame codec.
//!
//! Decoding is sans-io: complete frames are split off the front of a read
//! buffer and everything that can be checked without session state (frame
//! size, stream id zero rules, fixed payload lengths, padding) is checked
//! here.

use super::{H2Error, H2Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_FRAME_SIZE_LIMIT: u32 = 16_777_215;
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Error codes carried by RST_STREAM and GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            ErrorCode::NO_ERROR => "NO_ERROR",
            ErrorCode::PROTOCOL_ERROR => "PROTOCOL_ERROR",
            ErrorCode::INTERNAL_ERROR => "INTERNAL_ERROR",
            ErrorCode::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            ErrorCode::SETTINGS_TIMEOUT => "SETTINGS_TIMEOUT",
            ErrorCode::STREAM_CLOSED => "STREAM_CLOSED",
            ErrorCode::FRAME_SIZE_ERROR => "FRAME_SIZE_ERROR",
            ErrorCode::REFUSED_STREAM => "REFUSED_STREAM",
            ErrorCode::CANCEL => "CANCEL",
            ErrorCode::COMPRESSION_ERROR => "COMPRESSION_ERROR",
            ErrorCode::CONNECT_ERROR => "CONNECT_ERROR",
            ErrorCode::ENHANCE_YOUR_CALM => "ENHANCE_YOUR_CALM",
            ErrorCode::INADEQUATE_SECURITY => "INADEQUATE_SECURITY",
            ErrorCode::HTTP_1_1_REQUIRED => "HTTP_1_1_REQUIRED",
            ErrorCode(other) => return write!(f, "error code {other:#x}"),
        };
        f.write_str(name)
    }
}

/// SETTINGS parameters. Unset fields keep their previous value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    const HEADER_TABLE_SIZE: u16 = 0x1;
    const ENABLE_PUSH: u16 = 0x2;
    const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    const INITIAL_WINDOW_SIZE: u16 = 0x4;
    const MAX_FRAME_SIZE: u16 = 0x5;
    const MAX_HEADER_LIST_SIZE: u16 = 0x6;

    /// Parse and validate a SETTINGS payload. Unknown identifiers are
    /// ignored.
    pub fn decode(mut payload: &[u8]) -> H2Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(H2Error::with_code(
                ErrorCode::FRAME_SIZE_ERROR,
                "SETTINGS length not a multiple of 6",
            ));
        }
        let mut settings = Settings::default();
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                Self::HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                Self::ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => return Err(H2Error::protocol("SETTINGS_ENABLE_PUSH not 0 or 1")),
                },
                Self::MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                Self::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::with_code(
                            ErrorCode::FLOW_CONTROL_ERROR,
                            "SETTINGS_INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    settings.initial_window_size = Some(value);
                }
                Self::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                        return Err(H2Error::protocol("SETTINGS_MAX_FRAME_SIZE out of range"));
                    }
                    settings.max_frame_size = Some(value);
                }
                Self::MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(settings)
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        let mut put = |id: u16, value: Option<u32>| {
            if let Some(value) = value {
                dst.put_u16(id);
                dst.put_u32(value);
            }
        };
        put(Self::HEADER_TABLE_SIZE, self.header_table_size);
        put(Self::ENABLE_PUSH, self.enable_push.map(u32::from));
        put(Self::MAX_CONCURRENT_STREAMS, self.max_concurrent_streams);
        put(Self::INITIAL_WINDOW_SIZE, self.initial_window_size);
        put(Self::MAX_FRAME_SIZE, self.max_frame_size);
        put(Self::MAX_HEADER_LIST_SIZE, self.max_header_list_size);
    }

    fn payload_len(&self) -> usize {
        let set = [
            self.header_table_size.is_some(),
            self.enable_push.is_some(),
            self.max_concurrent_streams.is_some(),
            self.initial_window_size.is_some(),
            self.max_frame_size.is_some(),
            self.max_header_list_size.is_some(),
        ];
        set.iter().filter(|s| **s).count() * 6
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Payload length including padding; what flow control counts.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        dependency: Option<u32>,
    },
    Priority {
        stream_id: u32,
        dependency: u32,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Settings,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown frame types are skipped.
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

fn frame_size_error(reason: &'static str) -> H2Error {
    H2Error::with_code(ErrorCode::FRAME_SIZE_ERROR, reason)
}

/// Strip padding from a PADDED payload.
fn unpad(payload: &mut Bytes) -> H2Result<()> {
    if payload.is_empty() {
        return Err(frame_size_error("PADDED frame without pad length"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(H2Error::protocol("padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(())
}

/// Split one frame off the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered. Frames longer than
/// `max_frame_size` are a connection error.
pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> H2Result<Option<Frame>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
    if len > max_frame_size {
        return Err(frame_size_error("frame exceeds SETTINGS_MAX_FRAME_SIZE"));
    }
    let total = FRAME_HEADER_LEN + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let mut head = buf.split_to(FRAME_HEADER_LEN);
    let mut payload = buf.split_to(len as usize).freeze();
    head.advance(3);
    let frame_type = head.get_u8();
    let flag_bits = head.get_u8();
    let stream_id = head.get_u32() & MAX_WINDOW_SIZE;
    let flag = |f: u8| flag_bits & f != 0;

    let needs_stream = |frame: Frame| {
        if stream_id == 0 {
            Err(H2Error::protocol("frame requires a stream id"))
        } else {
            Ok(Some(frame))
        }
    };
    let needs_connection = |frame: Frame| {
        if stream_id != 0 {
            Err(H2Error::protocol("connection frame on a stream"))
        } else {
            Ok(Some(frame))
        }
    };

    match frame_type {
        kind::DATA => {
            if flag(flags::PADDED) {
                unpad(&mut payload)?;
            }
            needs_stream(Frame::Data {
                stream_id,
                data: payload,
                end_stream: flag(flags::END_STREAM),
                flow_len: len,
            })
        }
        kind::HEADERS => {
            if flag(flags::PADDED) {
                unpad(&mut payload)?;
            }
            let mut dependency = None;
            if flag(flags::PRIORITY) {
                if payload.len() < 5 {
                    return Err(frame_size_error("HEADERS priority block truncated"));
                }
                dependency = Some(payload.get_u32() & MAX_WINDOW_SIZE);
                payload.advance(1);
            }
            needs_stream(Frame::Headers {
                stream_id,
                block: payload,
                end_stream: flag(flags::END_STREAM),
                end_headers: flag(flags::END_HEADERS),
                dependency,
            })
        }
        kind::PRIORITY => {
            if len != 5 {
                return Err(frame_size_error("PRIORITY length must be 5"));
            }
            let dependency = payload.get_u32() & MAX_WINDOW_SIZE;
            needs_stream(Frame::Priority {
                stream_id,
                dependency,
            })
        }
        kind::RST_STREAM => {
            if len != 4 {
                return Err(frame_size_error("RST_STREAM length must be 4"));
            }
            needs_stream(Frame::RstStream {
                stream_id,
                code: ErrorCode(payload.get_u32()),
            })
        }
        kind::SETTINGS => {
            let ack = flag(flags::ACK);
            if ack && len != 0 {
                return Err(frame_size_error("SETTINGS ack with payload"));
            }
            let settings = Settings::decode(&payload)?;
            needs_connection(Frame::Settings { ack, settings })
        }
        kind::PUSH_PROMISE => needs_stream(Frame::PushPromise { stream_id }),
        kind::PING => {
            if len != 8 {
                return Err(frame_size_error("PING length must be 8"));
            }
            let mut data = [0u8; 8];
            payload.copy_to_slice(&mut data);
            needs_connection(Frame::Ping {
                ack: flag(flags::ACK),
                payload: data,
            })
        }
        kind::GOAWAY => {
            if len < 8 {
                return Err(frame_size_error("GOAWAY shorter than 8 bytes"));
            }
            let last_stream_id = payload.get_u32() & MAX_WINDOW_SIZE;
            let code = ErrorCode(payload.get_u32());
            needs_connection(Frame::GoAway {
                last_stream_id,
                code,
                debug: payload,
            })
        }
        kind::WINDOW_UPDATE => {
            if len != 4 {
                return Err(frame_size_error("WINDOW_UPDATE length must be 4"));
            }
            Ok(Some(Frame::WindowUpdate {
                stream_id,
                increment: payload.get_u32() & MAX_WINDOW_SIZE,
            }))
        }
        kind::CONTINUATION => needs_stream(Frame::Continuation {
            stream_id,
            block: payload,
            end_headers: flag(flags::END_HEADERS),
        }),
        other => Ok(Some(Frame::Unknown {
            kind: other,
            stream_id,
        })),
    }
}

fn put_header(dst: &mut BytesMut, len: usize, kind: u8, flag_bits: u8, stream_id: u32) {
    dst.reserve(FRAME_HEADER_LEN + len);
    dst.put_uint(len as u64, 3);
    dst.put_u8(kind);
    dst.put_u8(flag_bits);
    dst.put_u32(stream_id & MAX_WINDOW_SIZE);
}

pub fn encode_settings(settings: &Settings, dst: &mut BytesMut) {
    put_header(dst, settings.payload_len(), kind::SETTINGS, 0, 0);
    settings.encode_payload(dst);
}

pub fn encode_settings_ack(dst: &mut BytesMut) {
    put_header(dst, 0, kind::SETTINGS, flags::ACK, 0);
}

pub fn encode_data(stream_id: u32, data: &[u8], end_stream: bool, dst: &mut BytesMut) {
    let flag_bits = if end_stream { flags::END_STREAM } else { 0 };
    put_header(dst, data.len(), kind::DATA, flag_bits, stream_id);
    dst.put_slice(data);
}

/// Encode a header block, continuing it in CONTINUATION frames when it
/// does not fit in one frame.
pub fn encode_headers(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
    dst: &mut BytesMut,
) {
    let max = max_frame_size as usize;
    let mut chunks = block.chunks(max.max(1)).peekable();
    let first = chunks.next().unwrap_or(&[]);
    let mut flag_bits = if end_stream { flags::END_STREAM } else { 0 };
    if chunks.peek().is_none() {
        flag_bits |= flags::END_HEADERS;
    }
    put_header(dst, first.len(), kind::HEADERS, flag_bits, stream_id);
    dst.put_slice(first);
    while let Some(chunk) = chunks.next() {
        let flag_bits = if chunks.peek().is_none() {
            flags::END_HEADERS
        } else {
            0
        };
        put_header(dst, chunk.len(), kind::CONTINUATION, flag_bits, stream_id);
        dst.put_slice(chunk);
    }
}

pub fn encode_rst_stream(stream_id: u32, code: ErrorCode, dst: &mut BytesMut) {
    put_header(dst, 4, kind::RST_STREAM, 0, stream_id);
    dst.put_u32(code.0);
}

pub fn encode_ping(ack: bool, payload: [u8; 8], dst: &mut BytesMut) {
    let flag_bits = if ack { flags::ACK } else { 0 };
    put_header(dst, 8, kind::PING, flag_bits, 0);
    dst.put_slice(&payload);
}

pub fn encode_goaway(last_stream_id: u32, code: ErrorCode, debug: &[u8], dst: &mut BytesMut) {
    put_header(dst, 8 + debug.len(), kind::GOAWAY, 0, 0);
    dst.put_u32(last_stream_id & MAX_WINDOW_SIZE);
    dst.put_u32(code.0);
    dst.put_slice(debug);
}

pub fn encode_window_update(stream_id: u32, increment: u32, dst: &mut BytesMut) {
    put_header(dst, 4, kind::WINDOW_UPDATE, 0, stream_id);
    dst.put_u32(increment & MAX_WINDOW_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: u8, flag_bits: u8, stream_id: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        put_header(&mut buf, payload.len(), kind, flag_bits, stream_id);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_partial_frames_wait() {
        let full = raw(kind::PING, 0, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = BytesMut::from(&full[..12]);
        assert_eq!(decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(), None);
        buf.extend_from_slice(&full[12..]);
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::Ping {
                ack: false,
                payload: [1, 2, 3, 4, 5, 6, 7, 8]
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_padded_data_counts_padding() {
        // pad length 2, "hi", two pad bytes
        let mut buf = raw(kind::DATA, flags::PADDED | flags::END_STREAM, 1, &[2, b'h', b'i', 0, 0]);
        match decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            Some(Frame::Data {
                data,
                end_stream,
                flow_len,
                ..
            }) => {
                assert_eq!(&data[..], b"hi");
                assert!(end_stream);
                assert_eq!(flow_len, 5);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut buf = raw(kind::DATA, flags::PADDED, 1, &[9, b'h']);
        assert!(decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn test_stream_zero_rules() {
        let mut buf = raw(kind::DATA, 0, 0, b"x");
        assert!(matches!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE),
            Err(H2Error::Protocol {
                code: ErrorCode::PROTOCOL_ERROR,
                ..
            })
        ));
        let mut buf = raw(kind::PING, 0, 3, &[0; 8]);
        assert!(decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 20_000, kind::DATA, 0, 1);
        assert!(matches!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE),
            Err(H2Error::Protocol {
                code: ErrorCode::FRAME_SIZE_ERROR,
                ..
            })
        ));
    }

    #[test]
    fn test_settings_validation() {
        let settings = Settings {
            enable_push: Some(false),
            initial_window_size: Some(10),
            max_frame_size: Some(32_768),
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        encode_settings(&settings, &mut buf);
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::Settings {
                ack: false,
                settings
            })
        );

        // INITIAL_WINDOW_SIZE of 2^31
        let bad = [0, 4, 0x80, 0, 0, 0];
        assert!(matches!(
            Settings::decode(&bad),
            Err(H2Error::Protocol {
                code: ErrorCode::FLOW_CONTROL_ERROR,
                ..
            })
        ));
        // MAX_FRAME_SIZE below 16384
        assert!(Settings::decode(&[0, 5, 0, 0, 0x10, 0]).is_err());
        // unknown identifiers are ignored
        assert_eq!(
            Settings::decode(&[0, 0x42, 0, 0, 0, 1]).unwrap(),
            Settings::default()
        );
        assert!(Settings::decode(&[0, 1, 0]).is_err());
    }

    #[test]
    fn test_headers_split_into_continuation() {
        let block = vec![7u8; 40_000];
        let mut buf = BytesMut::new();
        encode_headers(5, &block, true, DEFAULT_MAX_FRAME_SIZE, &mut buf);

        let mut collected = Vec::new();
        match decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            Some(Frame::Headers {
                block,
                end_stream,
                end_headers,
                ..
            }) => {
                assert!(end_stream);
                assert!(!end_headers);
                collected.extend_from_slice(&block);
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut last = false;
        while let Some(frame) = decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            match frame {
                Frame::Continuation {
                    stream_id: 5,
                    block,
                    end_headers,
                } => {
                    collected.extend_from_slice(&block);
                    last = end_headers;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(last);
        assert_eq!(collected, block);
    }

    #[test]
    fn test_goaway_and_window_update_encoding() {
        let mut buf = BytesMut::new();
        encode_goaway(7, ErrorCode::STREAM_CLOSED, b"bye", &mut buf);
        encode_window_update(3, 1024, &mut buf);
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::GoAway {
                last_stream_id: 7,
                code: ErrorCode::STREAM_CLOSED,
                debug: Bytes::from_static(b"bye"),
            })
        );
        assert_eq!(
            decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::WindowUpdate {
                stream_id: 3,
                increment: 1024
            })
        );
    }
}
