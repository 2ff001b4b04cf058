use thiserror::Error;
use walrelay_core::FrameError;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("could not start logical replication: {0}")]
    StartReplication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server error during streaming: {0}")]
    Server(String),

    #[error("failed to apply change: {0}")]
    Apply(String),

    #[error("host process has died")]
    HostGone,
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
