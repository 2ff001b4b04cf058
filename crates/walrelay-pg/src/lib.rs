pub mod apply;
mod connect;
mod error;
pub mod feedback;
pub mod mock;
pub mod replication;
pub mod session;

pub use apply::{ChangeApplier, PgApplier};
pub use connect::connect_postgres;
pub use error::{PgError, PgResult};
pub use feedback::send_feedback;
pub use replication::{
    parse_connection_string, ConnectionParams, CopyRead, ReplicationConnection,
    ReplicationTransport,
};
pub use session::{exit_code, SessionExit, SessionSettings, SessionSignals, StreamingSession};
