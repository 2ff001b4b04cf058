use crate::lsn::Lsn;

/// Write/flush positions reported back to the origin.
///
/// `flushed` is set equal to `written` on every observation, without waiting
/// for the corresponding statements to be committed locally. A crash in the
/// middle of a drain cycle can therefore leave the origin believing a later
/// position was flushed than what was durably applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionTracker {
    written: Lsn,
    flushed: Lsn,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a position seen on the stream. Never moves backwards.
    pub fn observe(&mut self, pos: Lsn) {
        self.written = self.written.max(pos);
        self.flushed = self.written;
    }

    pub fn written(&self) -> Lsn {
        self.written
    }

    pub fn flushed(&self) -> Lsn {
        self.flushed
    }
}
