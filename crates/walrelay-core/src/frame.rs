//! Decoder for the CopyData frames carried by a logical replication stream.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-replication.html
//!
//! All integers are big-endian. Decoding never allocates: a [`WalData`]
//! frame borrows its payload from the receive buffer.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::lsn::Lsn;

/// Tag of a primary keepalive message.
pub const KEEPALIVE_TAG: u8 = b'k';
/// Tag of an XLogData message.
pub const WAL_DATA_TAG: u8 = b'w';

/// 'k' + walEnd + sendTime + replyRequested.
pub const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
/// 'w' + dataStart + walEnd + sendTime.
pub const WAL_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Keepalive(Keepalive),
    WalData(WalData<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Current end of WAL on the server.
    pub server_position: Lsn,
    /// Server clock, microseconds since 2000-01-01.
    pub send_time: i64,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalData<'a> {
    pub data_start: Lsn,
    pub wal_end: Lsn,
    pub send_time: i64,
    /// Statement text produced by the output plugin. May be empty.
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decode one frame from the body of a CopyData message.
    pub fn decode(buf: &'a [u8]) -> Result<Self, FrameError> {
        let Some(&tag) = buf.first() else {
            return Err(FrameError::Empty);
        };

        match tag {
            KEEPALIVE_TAG => {
                check_len(tag, buf, KEEPALIVE_LEN)?;
                let mut cursor = Cursor::new(&buf[1..]);
                let server_position = read_lsn(&mut cursor, tag, buf.len())?;
                let send_time = read_i64(&mut cursor, tag, buf.len())?;
                let reply_requested = buf[KEEPALIVE_LEN - 1] != 0;

                Ok(Frame::Keepalive(Keepalive {
                    server_position,
                    send_time,
                    reply_requested,
                }))
            }
            WAL_DATA_TAG => {
                check_len(tag, buf, WAL_DATA_HEADER_LEN)?;
                let mut cursor = Cursor::new(&buf[1..]);
                let data_start = read_lsn(&mut cursor, tag, buf.len())?;
                let wal_end = read_lsn(&mut cursor, tag, buf.len())?;
                let send_time = read_i64(&mut cursor, tag, buf.len())?;

                Ok(Frame::WalData(WalData {
                    data_start,
                    wal_end,
                    send_time,
                    payload: &buf[WAL_DATA_HEADER_LEN..],
                }))
            }
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

impl Keepalive {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(KEEPALIVE_LEN);
        buf.put_u8(KEEPALIVE_TAG);
        buf.put_u64(self.server_position.0);
        buf.put_i64(self.send_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }
}

impl WalData<'_> {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(WAL_DATA_HEADER_LEN + self.payload.len());
        buf.put_u8(WAL_DATA_TAG);
        buf.put_u64(self.data_start.0);
        buf.put_u64(self.wal_end.0);
        buf.put_i64(self.send_time);
        buf.put_slice(self.payload);
        buf.freeze()
    }

    /// Payload as statement text. Invalid UTF-8 is replaced, not rejected.
    pub fn statement(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.payload)
    }
}

fn check_len(tag: u8, buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::TruncatedFrame {
            tag: tag as char,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_lsn(cursor: &mut Cursor<&[u8]>, tag: u8, actual: usize) -> Result<Lsn, FrameError> {
    cursor
        .read_u64::<BigEndian>()
        .map(Lsn)
        .map_err(|_| truncated(tag, actual))
}

fn read_i64(cursor: &mut Cursor<&[u8]>, tag: u8, actual: usize) -> Result<i64, FrameError> {
    cursor
        .read_i64::<BigEndian>()
        .map_err(|_| truncated(tag, actual))
}

fn truncated(tag: u8, actual: usize) -> FrameError {
    let needed = if tag == KEEPALIVE_TAG {
        KEEPALIVE_LEN
    } else {
        WAL_DATA_HEADER_LEN
    };
    FrameError::TruncatedFrame {
        tag: tag as char,
        needed,
        actual,
    }
}
