//! Close codes and CLOSE frame payloads.

use super::{WsError, WsResult};
use bytes::{BufMut, Bytes, BytesMut};

/// WebSocket close codes as defined in RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure.
    Normal,
    /// Endpoint going away.
    GoingAway,
    /// Protocol error.
    Protocol,
    /// Unsupported data type.
    Unsupported,
    /// No status received. Local only, never sent.
    NoStatus,
    /// Abnormal closure. Local only, never sent.
    Abnormal,
    /// Invalid frame payload data.
    InvalidData,
    /// Policy violation.
    PolicyViolation,
    /// Message too big.
    MessageTooBig,
    /// Missing extension.
    MissingExtension,
    /// Internal server error.
    InternalError,
    /// TLS handshake failure. Local only, never sent.
    TlsHandshake,
    /// Other registered or application code.
    Custom(u16),
}

impl CloseCode {
    /// Whether the code may appear in a CLOSE frame on the wire.
    pub fn is_sendable(&self) -> bool {
        let code: u16 = (*self).into();
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Codes reserved for local reporting.
    pub fn is_reserved(&self) -> bool {
        let code: u16 = (*self).into();
        matches!(code, 1004 | 1005 | 1006 | 1015)
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidData,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MissingExtension,
            1011 => Self::InternalError,
            1015 => Self::TlsHandshake,
            code => Self::Custom(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MissingExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Custom(code) => code,
        }
    }
}

/// Decoded CLOSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parse a received CLOSE payload. Empty payloads carry no status.
    pub fn parse(payload: &[u8]) -> WsResult<Option<CloseFrame>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(WsError::Protocol("close payload of one byte")),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_sendable() {
                    return Err(WsError::Protocol("invalid close code"));
                }
                let reason =
                    std::str::from_utf8(&payload[2..]).map_err(|_| WsError::InvalidUtf8)?;
                Ok(Some(CloseFrame::new(code, reason)))
            }
        }
    }

    /// Encode for the wire. The reason is cut to fit a control frame.
    pub fn encode(&self) -> Bytes {
        let mut reason = self.reason.as_str();
        while reason.len() > 123 {
            let mut cut = 123;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason = &reason[..cut];
        }
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(self.code.into());
        buf.put_slice(reason.as_bytes());
        buf.freeze()
    }
}
