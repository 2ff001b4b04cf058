use std::future::Future;

use bytes::Bytes;

use crate::error::PgResult;

/// Result of a non-blocking read from the COPY stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyRead {
    /// Body of one CopyData message.
    Data(Bytes),
    /// Nothing complete is buffered and the socket has no more input right now.
    WouldBlock,
    /// The server ended the COPY stream.
    Done,
}

/// The session's view of the replication connection.
pub trait ReplicationTransport: Send {
    /// Return the next buffered frame, reading from the socket without blocking.
    fn try_next_frame(&mut self) -> PgResult<CopyRead>;

    /// Resolve once input is available.
    fn wait_readable(&mut self) -> impl Future<Output = PgResult<()>> + Send;

    /// Pull whatever is pending on the socket into the receive buffer.
    fn consume_input(&mut self) -> PgResult<()>;

    /// Send one CopyData message and flush it.
    fn send_copy_data(&mut self, data: &[u8]) -> impl Future<Output = PgResult<()>> + Send;

    /// End the stream and release the connection. Errors are ignored.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
