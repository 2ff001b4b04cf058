//! Standby status update ('r') messages.

use bytes::BufMut;

use crate::lsn::Lsn;
use crate::position::PositionTracker;

pub const STATUS_UPDATE_TAG: u8 = b'r';

/// 'r' + write + flush + apply + sendTime + replyRequested.
pub const STATUS_UPDATE_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// Value sent in the apply slot: this receiver never reports apply progress.
pub const APPLY_UNSET: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub written: Lsn,
    pub flushed: Lsn,
    /// Microseconds since 2000-01-01.
    pub timestamp: i64,
}

impl StatusUpdate {
    pub fn from_tracker(tracker: &PositionTracker, timestamp: i64) -> Self {
        Self {
            written: tracker.written(),
            flushed: tracker.flushed(),
            timestamp,
        }
    }

    pub fn encode(&self) -> [u8; STATUS_UPDATE_LEN] {
        let mut out = [0u8; STATUS_UPDATE_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(STATUS_UPDATE_TAG);
        buf.put_u64(self.written.0);
        buf.put_u64(self.flushed.0);
        buf.put_i64(APPLY_UNSET);
        buf.put_i64(self.timestamp);
        // Never ask the server to reply.
        buf.put_u8(0);
        out
    }
}
