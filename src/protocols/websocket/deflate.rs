//! permessage-deflate (RFC 7692).
//!
//! Messages are raw DEFLATE streams flushed with a sync flush; the trailing
//! `00 00 ff ff` of the flush is dropped on send and restored on receive.
//! Only 15-bit windows are supported, so offers that ask the server to use
//! a smaller window are declined.

use super::{WsError, WsResult};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const EXTENSION: &str = "permessage-deflate";

/// Negotiated extension parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server resets its compressor after each message.
    pub server_no_context_takeover: bool,
    /// Client resets its compressor after each message.
    pub client_no_context_takeover: bool,
}

impl DeflateConfig {
    /// Value for the Sec-WebSocket-Extensions response header.
    pub fn response_header(&self) -> String {
        let mut header = EXTENSION.to_string();
        if self.server_no_context_takeover {
            header.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            header.push_str("; client_no_context_takeover");
        }
        header
    }
}

/// Accept the first permessage-deflate offer we can honor.
pub fn negotiate(offers: &str) -> Option<DeflateConfig> {
    offers.split(',').find_map(|offer| {
        let mut params = offer.split(';').map(str::trim);
        if !params.next()?.eq_ignore_ascii_case(EXTENSION) {
            return None;
        }
        let mut config = DeflateConfig::default();
        for param in params.filter(|p| !p.is_empty()) {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };
            match (name.to_ascii_lowercase().as_str(), value) {
                ("server_no_context_takeover", None) => config.server_no_context_takeover = true,
                ("client_no_context_takeover", None) => config.client_no_context_takeover = true,
                // any client window fits in our 15-bit inflate window
                ("client_max_window_bits", None) => {}
                ("client_max_window_bits", Some(bits)) => {
                    if !matches!(bits.parse::<u8>(), Ok(8..=15)) {
                        return None;
                    }
                }
                ("server_max_window_bits", Some("15")) => {}
                _ => return None,
            }
        }
        Some(config)
    })
}

/// Outbound compressor.
pub struct Deflater {
    compress: Compress,
    reset_per_message: bool,
}

impl Deflater {
    pub fn new(config: &DeflateConfig) -> Self {
        Self {
            compress: Compress::new(Compression::default(), false),
            reset_per_message: config.server_no_context_takeover,
        }
    }

    /// Compress one whole message.
    pub fn compress(&mut self, input: &[u8]) -> WsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start = self.compress.total_in();
        loop {
            let consumed = (self.compress.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(1024));
            }
            self.compress
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| WsError::Compression(e.to_string()))?;
            let consumed = (self.compress.total_in() - start) as usize;
            // the sync flush is complete once output stops filling the buffer
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&SYNC_TAIL) {
            out.truncate(out.len() - SYNC_TAIL.len());
        }
        if self.reset_per_message {
            self.compress.reset();
        }
        Ok(out)
    }
}

/// Inbound decompressor.
pub struct Inflater {
    decompress: Decompress,
    reset_per_message: bool,
}

impl Inflater {
    pub fn new(config: &DeflateConfig) -> Self {
        Self {
            decompress: Decompress::new(false),
            reset_per_message: config.client_no_context_takeover,
        }
    }

    /// Inflate one whole message, refusing output beyond `limit` bytes.
    pub fn decompress(&mut self, input: &[u8], limit: usize) -> WsResult<Vec<u8>> {
        let mut data = Vec::with_capacity(input.len() + SYNC_TAIL.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&SYNC_TAIL);

        let mut out = Vec::with_capacity((input.len() * 2).clamp(64, limit.max(64)));
        let start_in = self.decompress.total_in();
        loop {
            let consumed = (self.decompress.total_in() - start_in) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(1024));
            }
            let before_out = out.len();
            let status = self
                .decompress
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| WsError::Compression(e.to_string()))?;
            if out.len() > limit {
                return Err(WsError::MessageTooBig {
                    size: out.len(),
                    limit,
                });
            }
            let now_consumed = (self.decompress.total_in() - start_in) as usize;
            let done = now_consumed == data.len() && out.len() < out.capacity();
            let stalled = now_consumed == consumed && out.len() == before_out;
            if done || matches!(status, Status::StreamEnd) || stalled {
                break;
            }
        }
        if self.reset_per_message {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}
