use thiserror::Error;

/// Errors that can occur in walrelay-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),
}

/// Decode failures for a single inbound CopyData frame.
///
/// Every variant means the stream is desynchronized; callers do not retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("streaming header too small for '{tag}' frame: need {needed} bytes, got {actual}")]
    TruncatedFrame {
        tag: char,
        needed: usize,
        actual: usize,
    },

    #[error("incorrect streaming header: unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),
}
