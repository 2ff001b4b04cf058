//! Sends standby status updates to the origin.

use tracing::{info, warn};
use walrelay_core::{PositionTracker, StatusUpdate};

use crate::error::PgResult;
use crate::replication::ReplicationTransport;

/// Report the tracker's positions to the origin. `now` is in PostgreSQL-epoch microseconds.
pub async fn send_feedback<T: ReplicationTransport>(
    transport: &mut T,
    tracker: &PositionTracker,
    now: i64,
) -> PgResult<()> {
    let update = StatusUpdate::from_tracker(tracker, now);

    info!(
        "confirming write up to {}, flush to {}",
        update.written, update.flushed
    );

    transport
        .send_copy_data(&update.encode())
        .await
        .inspect_err(|e| warn!(error = %e, "could not send feedback packet"))
}
