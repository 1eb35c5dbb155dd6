//! Flow-control windows.
//!
//! Windows are kept as `i64` because a SETTINGS change to the initial
//! window size can drive a send window negative (RFC 9113 section 6.9.2).

use super::frame::MAX_WINDOW_SIZE;

const MAX_WINDOW: i64 = MAX_WINDOW_SIZE as i64;

/// Outbound credit granted by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow(i64);

/// The window would exceed 2^31-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOverflow;

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        Self(initial as i64)
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> usize {
        self.0.max(0) as usize
    }

    /// Account for `n` bytes sent. Callers never send more than
    /// [`available`](Self::available).
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.0 -= n as i64;
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn increase(&mut self, increment: u32) -> Result<(), WindowOverflow> {
        self.adjust(increment as i64)
    }

    /// Apply the difference between an old and new initial window size.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        let next = self.0 + delta;
        if next > MAX_WINDOW {
            return Err(WindowOverflow);
        }
        self.0 = next;
        Ok(())
    }
}

/// Inbound credit we granted, and how much of it to hand back.
///
/// Credit is returned in batches once at least half the window has been
/// consumed, so a slow trickle of DATA does not produce a WINDOW_UPDATE per
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    window: i64,
    target: i64,
    unreleased: i64,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: initial as i64,
            target: initial as i64,
            unreleased: 0,
        }
    }

    /// Raise the window we advertise (connection window after our SETTINGS).
    pub fn grow_to(&mut self, target: u32) -> Option<u32> {
        let target = target as i64;
        if target <= self.target {
            return None;
        }
        let increment = target - self.target;
        self.target = target;
        self.window += increment;
        Some(increment as u32)
    }

    /// Account for received DATA. Fails when the peer overran the window.
    pub fn receive(&mut self, len: u32) -> Result<(), WindowOverflow> {
        let len = len as i64;
        if len > self.window {
            return Err(WindowOverflow);
        }
        self.window -= len;
        Ok(())
    }

    /// The application consumed `len` bytes. Returns the WINDOW_UPDATE
    /// increment to send, if one is due.
    pub fn release(&mut self, len: u32) -> Option<u32> {
        self.unreleased += len as i64;
        if self.unreleased > 0 && self.unreleased * 2 >= self.target {
            let increment = self.unreleased;
            self.unreleased = 0;
            self.window += increment;
            Some(increment as u32)
        } else {
            None
        }
    }

    pub fn available(&self) -> usize {
        self.window.max(0) as usize
    }
}
