//! Replication-mode connection to the origin server.
//!
//! Speaks the streaming replication protocol directly on top of
//! `postgres-protocol` so the session can poll for frames without
//! blocking and wait on socket readiness with its own deadline.

pub mod connection;
pub mod conninfo;
pub mod transport;

pub use connection::ReplicationConnection;
pub use conninfo::{parse_connection_string, ConnectionParams};
pub use transport::{CopyRead, ReplicationTransport};
