//! Raw HTTP/2 frames for driving the server by hand.

use fluke_hpack::{Decoder, Encoder};
use std::io::Read;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const SETTINGS: u8 = 0x4;
pub const GOAWAY: u8 = 0x7;
pub const END_STREAM: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;

pub fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = len.to_be_bytes()[1..].to_vec();
    out.push(kind);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

pub fn read_frame(stream: &mut impl Read) -> Frame {
    let mut head = [0u8; 9];
    stream.read_exact(&mut head).unwrap();
    let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    Frame {
        kind: head[3],
        flags: head[4],
        stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
        payload,
    }
}

pub fn get(stream_id: u32, path: &str) -> Vec<u8> {
    let fields: [(&[u8], &[u8]); 4] = [
        (&b":method"[..], &b"GET"[..]),
        (&b":scheme"[..], &b"http"[..]),
        (&b":path"[..], path.as_bytes()),
        (&b":authority"[..], &b"test"[..]),
    ];
    let block = Encoder::new().encode(fields);
    frame(HEADERS, END_STREAM | END_HEADERS, stream_id, &block)
}

/// Read frames until every stream in `ids` has ended. Returns
/// (status, body) per stream, in `ids` order.
pub fn read_responses(stream: &mut impl Read, ids: &[u32]) -> Vec<(String, Vec<u8>)> {
    let mut decoder = Decoder::new();
    let mut responses: Vec<(Option<String>, Vec<u8>, bool)> =
        ids.iter().map(|_| (None, Vec::new(), false)).collect();
    while responses.iter().any(|(_, _, done)| !done) {
        let frame = read_frame(stream);
        assert_ne!(frame.kind, GOAWAY, "unexpected GOAWAY");
        let Some(slot) = ids.iter().position(|id| *id == frame.stream_id) else {
            continue;
        };
        let (status, body, done) = &mut responses[slot];
        match frame.kind {
            HEADERS => {
                let fields = decoder.decode(&frame.payload).unwrap();
                let (name, value) = &fields[0];
                assert_eq!(name, b":status");
                *status = Some(String::from_utf8(value.clone()).unwrap());
            }
            DATA => body.extend_from_slice(&frame.payload),
            _ => continue,
        }
        if frame.flags & END_STREAM != 0 {
            *done = true;
        }
    }
    responses
        .into_iter()
        .map(|(status, body, _)| (status.unwrap(), body))
        .collect()
}
