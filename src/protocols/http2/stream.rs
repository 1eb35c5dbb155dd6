//! Stream state machine (RFC 9113 section 5.1).
//!
//! Only the transitions a server can take are modelled: streams are opened
//! by client HEADERS and never reserved, since push is disabled.

/// Lifecycle of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We finished sending; the peer may still send.
    HalfClosedLocal,
    /// The peer finished sending; we may still send.
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// HEADERS opening the stream.
    pub fn recv_headers(self, end_stream: bool) -> Option<StreamState> {
        match self {
            StreamState::Idle if end_stream => Some(StreamState::HalfClosedRemote),
            StreamState::Idle => Some(StreamState::Open),
            _ => None,
        }
    }

    /// The peer set END_STREAM.
    pub fn recv_end_stream(self) -> Option<StreamState> {
        match self {
            StreamState::Open => Some(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => Some(StreamState::Closed),
            _ => None,
        }
    }

    /// We set END_STREAM.
    pub fn send_end_stream(self) -> Option<StreamState> {
        match self {
            StreamState::Open => Some(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => Some(StreamState::Closed),
            _ => None,
        }
    }

    /// Whether the peer may still send DATA or trailers.
    pub fn can_recv(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Whether we may still send DATA.
    pub fn can_send(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_then_response() {
        let state = StreamState::Idle.recv_headers(false).unwrap();
        assert_eq!(state, StreamState::Open);
        assert!(state.can_recv());
        let state = state.recv_end_stream().unwrap();
        assert_eq!(state, StreamState::HalfClosedRemote);
        assert!(!state.can_recv());
        assert!(state.can_send());
        assert_eq!(state.send_end_stream(), Some(StreamState::Closed));
    }

    #[test]
    fn test_response_before_request_finishes() {
        let state = StreamState::Idle.recv_headers(false).unwrap();
        let state = state.send_end_stream().unwrap();
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert!(state.can_recv());
        assert_eq!(state.recv_end_stream(), Some(StreamState::Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(StreamState::Open.recv_headers(false), None);
        assert_eq!(StreamState::HalfClosedRemote.recv_end_stream(), None);
        assert_eq!(StreamState::Closed.send_end_stream(), None);
        assert!(!StreamState::Idle.can_recv());
    }
}
