pub mod error;
pub mod feedback;
pub mod frame;
pub mod guard;
pub mod lsn;
pub mod position;
pub mod statement;
pub mod time;

pub use error::{Error, FrameError};
pub use feedback::{StatusUpdate, APPLY_UNSET, STATUS_UPDATE_LEN};
pub use frame::{Frame, Keepalive, WalData, KEEPALIVE_LEN, WAL_DATA_HEADER_LEN};
pub use guard::{is_restricted, GuardPolicy};
pub use lsn::Lsn;
pub use position::PositionTracker;
pub use statement::{ApplyOutcome, StatementKind};
pub use time::{pg_now, to_pg_micros, wakeup_timeout, PG_EPOCH_OFFSET_SECS};
