//! WebSocket frame codec.
//!
//! Frames are decoded from a buffer one at a time; [`FrameReader`] keeps
//! that buffer filled from an async byte stream. Parsing
//! enforces the RFC 6455 rules that do not depend on message state: control
//! frames are final and at most 125 bytes, lengths use the minimal
//! encoding, reserved bits need a negotiated extension, and masking follows
//! the role of the sender.

use super::{WsError, WsResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame.
    Continuation,
    /// Text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Close frame.
    Close,
    /// Ping frame.
    Ping,
    /// Pong frame.
    Pong,
}

impl OpCode {
    /// Check if this is a control frame.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Check if this is a data frame.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continuation)
    }

    /// Decode a wire opcode. Reserved values yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Continuation),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Continuation => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }
}

/// Which end of the connection a codec speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives masked frames, sends unmasked ones.
    Server,
    /// Receives unmasked frames, sends masked ones.
    Client,
}

/// A single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Last frame of a message.
    pub fin: bool,
    /// RSV1; marks a compressed message under permessage-deflate.
    pub rsv1: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Serialize, masking the payload with `mask` when given.
    pub fn encode(&self, mask: Option<[u8; 4]>, out: &mut BytesMut) {
        let len = self.payload.len();
        out.reserve(14 + len);

        let mut b0 = u8::from(self.opcode);
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        out.put_u8(b0);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len < 126 {
            out.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        match mask {
            None => out.put_slice(&self.payload),
            Some(key) => {
                out.put_slice(&key);
                let start = out.len();
                out.put_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
        }
    }
}

/// Limits and role applied while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub role: Role,
    pub max_payload: usize,
    /// RSV1 is only legal once permessage-deflate is negotiated.
    pub allow_rsv1: bool,
}

/// XOR `data` with the repeating masking key.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Bytes requested from the stream per read.
const READ_CHUNK: usize = 8 * 1024;

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until the whole frame is buffered, leaving `src`
/// untouched. Header violations are reported as soon as the header bytes
/// are in, before the payload arrives.
pub fn decode(src: &mut BytesMut, opts: &ParseOptions) -> WsResult<Option<Frame>> {
    if src.len() < 2 {
        return Ok(None);
    }
    let (b0, b1) = (src[0], src[1]);

    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    if b0 & 0x30 != 0 {
        return Err(WsError::Protocol("reserved bits set"));
    }
    if rsv1 && !opts.allow_rsv1 {
        return Err(WsError::Protocol("RSV1 set without a negotiated extension"));
    }
    let opcode = OpCode::from_u8(b0 & 0x0f).ok_or(WsError::Protocol("reserved opcode"))?;

    let masked = b1 & 0x80 != 0;
    match (opts.role, masked) {
        (Role::Server, false) => return Err(WsError::Protocol("client frame not masked")),
        (Role::Client, true) => return Err(WsError::Protocol("server frame masked")),
        _ => {}
    }

    let (len, header_len) = match b1 & 0x7f {
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[2], src[3]]) as u64;
            if len < 126 {
                return Err(WsError::Protocol("non-minimal payload length"));
            }
            (len, 4)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&src[2..10]);
            let len = u64::from_be_bytes(ext);
            if len >> 63 != 0 {
                return Err(WsError::Protocol("payload length has the top bit set"));
            }
            if len <= u16::MAX as u64 {
                return Err(WsError::Protocol("non-minimal payload length"));
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(WsError::Protocol("fragmented control frame"));
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WsError::Protocol("control frame payload over 125 bytes"));
        }
        if rsv1 {
            return Err(WsError::Protocol("RSV1 set on a control frame"));
        }
    }
    if len > opts.max_payload as u64 {
        return Err(WsError::MessageTooBig {
            size: usize::try_from(len).unwrap_or(usize::MAX),
            limit: opts.max_payload,
        });
    }

    // bounded by max_payload above
    let len = len as usize;
    let mask_len = if masked { 4 } else { 0 };
    let total = header_len + mask_len + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(header_len);
    let mask = masked.then(|| {
        let key = [src[0], src[1], src[2], src[3]];
        src.advance(4);
        key
    });
    let mut payload = src.split_to(len);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        rsv1,
        opcode,
        payload: payload.freeze(),
    }))
}

/// Pulls frames off a byte stream.
///
/// Input that does not yet form a whole frame stays buffered between calls,
/// so [`read_frame`](Self::read_frame) may be dropped at any await point
/// (inside `select!`, say) without losing bytes.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    opts: ParseOptions,
}

impl FrameReader {
    pub fn new(opts: ParseOptions) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            opts,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    pub async fn read_frame<R>(&mut self, src: &mut R) -> WsResult<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = decode(&mut self.buf, &self.opts)? {
                return Ok(Some(frame));
            }
            self.buf.reserve(READ_CHUNK);
            if src.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const SERVER: ParseOptions = ParseOptions {
        role: Role::Server,
        max_payload: 1024,
        allow_rsv1: false,
    };

    fn masked(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.encode(Some([0x37, 0xfa, 0x21, 0x3d]), &mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_rfc_masked_text_example() {
        // "Hello" from RFC 6455 section 5.7
        let wire = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut src = Builder::new().read(&wire).build();
        let frame = FrameReader::new(SERVER).read_frame(&mut src).await.unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[tokio::test]
    async fn test_unmasked_encoding_for_server() {
        let mut buf = BytesMut::new();
        Frame::new(OpCode::Text, "Hello").encode(None, &mut buf);
        assert_eq!(&buf[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        let mut buf = BytesMut::new();
        Frame::new(OpCode::Binary, vec![0u8; 300]).encode(None, &mut buf);
        assert_eq!(&buf[..4], &[0x82, 126, 0x01, 0x2c]);
    }

    #[tokio::test]
    async fn test_extended_lengths() {
        let frame = Frame::new(OpCode::Binary, vec![9u8; 70_000]);
        let opts = ParseOptions {
            max_payload: 100_000,
            ..SERVER
        };
        let mut src = Builder::new().read(&masked(&frame)).build();
        let parsed = FrameReader::new(opts).read_frame(&mut src).await.unwrap().unwrap();
        assert_eq!(parsed.payload.len(), 70_000);
        assert!(parsed.payload.iter().all(|&b| b == 9));
    }

    #[tokio::test]
    async fn test_fragmented_control_frame_rejected() {
        let frame = Frame::new(OpCode::Ping, "x").with_fin(false);
        let mut src = Builder::new().read(&masked(&frame)[..2]).build();
        assert!(matches!(
            FrameReader::new(SERVER).read_frame(&mut src).await,
            Err(WsError::Protocol("fragmented control frame"))
        ));
    }

    #[tokio::test]
    async fn test_oversized_control_frame_rejected() {
        let frame = Frame::new(OpCode::Ping, vec![0u8; 126]);
        let wire = masked(&frame);
        // length check fires before the mask and payload are read
        let mut src = Builder::new().read(&wire[..4]).build();
        assert!(matches!(
            FrameReader::new(SERVER).read_frame(&mut src).await,
            Err(WsError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_rejected() {
        let mut wire = BytesMut::new();
        Frame::new(OpCode::Text, "hi").encode(None, &mut wire);
        let mut src = Builder::new().read(&wire[..2]).build();
        assert!(matches!(
            FrameReader::new(SERVER).read_frame(&mut src).await,
            Err(WsError::Protocol("client frame not masked"))
        ));

        let client = ParseOptions {
            role: Role::Client,
            ..SERVER
        };
        let mut src = Builder::new().read(&wire).build();
        assert!(FrameReader::new(client).read_frame(&mut src).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reserved_bits_and_opcodes() {
        let mut src = Builder::new().read(&[0xc1, 0x80]).build();
        assert!(FrameReader::new(SERVER).read_frame(&mut src).await.is_err());

        let mut src = Builder::new().read(&[0x83, 0x80]).build();
        assert!(matches!(
            FrameReader::new(SERVER).read_frame(&mut src).await,
            Err(WsError::Protocol("reserved opcode"))
        ));

        let deflate = ParseOptions {
            allow_rsv1: true,
            ..SERVER
        };
        let mut src = Builder::new().read(&[0xc1, 0x80, 0, 0, 0, 0]).build();
        let frame = FrameReader::new(deflate).read_frame(&mut src).await.unwrap().unwrap();
        assert!(frame.rsv1);
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let frame = Frame::new(OpCode::Binary, vec![0u8; 2048]);
        let wire = masked(&frame);
        let mut src = Builder::new().read(&wire[..4]).build();
        assert!(matches!(
            FrameReader::new(SERVER).read_frame(&mut src).await,
            Err(WsError::MessageTooBig { size: 2048, limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let mut src = Builder::new().build();
        assert!(FrameReader::new(SERVER).read_frame(&mut src).await.unwrap().is_none());
    }

    #[test]
    fn test_decode_inverts_encode() {
        let opcodes = [
            OpCode::Continuation,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ];
        for opcode in opcodes {
            for len in [0usize, 125, 126, 65_535, 65_536] {
                if opcode.is_control() && len > MAX_CONTROL_PAYLOAD {
                    continue;
                }
                let flags: &[(bool, bool)] = if opcode.is_control() {
                    &[(true, false)]
                } else {
                    &[(true, false), (false, false), (true, true), (false, true)]
                };
                for &(fin, rsv1) in flags {
                    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                    let frame = Frame::new(opcode, payload).with_fin(fin).with_rsv1(rsv1);
                    for (role, mask) in [(Role::Server, Some([9, 8, 7, 6])), (Role::Client, None)] {
                        let opts = ParseOptions {
                            role,
                            max_payload: 1 << 17,
                            allow_rsv1: true,
                        };
                        let mut wire = BytesMut::new();
                        frame.encode(mask, &mut wire);
                        wire.extend_from_slice(b"next");

                        let decoded = decode(&mut wire, &opts).unwrap();
                        assert_eq!(
                            decoded.as_ref(),
                            Some(&frame),
                            "{opcode:?} len={len} fin={fin} rsv1={rsv1} {role:?}"
                        );
                        assert_eq!(&wire[..], b"next");
                    }
                }
            }
        }
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let frame = Frame::new(OpCode::Binary, vec![3u8; 300]);
        let wire = masked(&frame);
        let mut buf = BytesMut::new();
        for chunk in wire.chunks(7) {
            assert!(decode(&mut buf, &SERVER).unwrap().is_none());
            buf.extend_from_slice(chunk);
        }
        assert_eq!(decode(&mut buf, &SERVER).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_survives_cancellation() {
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::new(OpCode::Binary, vec![7u8; 200]);
        let wire = masked(&frame);
        let mut reader = FrameReader::new(SERVER);

        client.write_all(&wire[..50]).await.unwrap();
        let pending =
            tokio::time::timeout(Duration::from_millis(20), reader.read_frame(&mut server)).await;
        assert!(pending.is_err());

        client.write_all(&wire[50..]).await.unwrap();
        assert_eq!(reader.read_frame(&mut server).await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let wire = masked(&Frame::new(OpCode::Text, "Hello"));
        let mut src = Builder::new().read(&wire[..6]).build();
        assert!(matches!(
            FrameReader::new(SERVER).read_frame(&mut src).await,
            Err(WsError::Io(_))
        ));
    }
}
