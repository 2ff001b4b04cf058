//! Clock helpers using the PostgreSQL epoch (2000-01-01 00:00:00 UTC).

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Days between 1970-01-01 and 2000-01-01.
const PG_EPOCH_OFFSET_DAYS: i64 = 10_957;

/// Seconds between the Unix epoch and the PostgreSQL epoch.
pub const PG_EPOCH_OFFSET_SECS: i64 = PG_EPOCH_OFFSET_DAYS * 86_400;

const USECS_PER_SEC: i64 = 1_000_000;

/// Current time in microseconds since the PostgreSQL epoch.
pub fn pg_now() -> i64 {
    to_pg_micros(Utc::now())
}

pub fn to_pg_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros() - PG_EPOCH_OFFSET_SECS * USECS_PER_SEC
}

/// How long to block waiting for input before the next status deadline.
///
/// Targets are PostgreSQL-epoch microseconds, non-positive meaning unset.
/// The result is never shorter than one second.
pub fn wakeup_timeout(now: i64, message_target: i64, fsync_target: i64) -> Duration {
    let mut target = message_target;
    if fsync_target > 0 && (target <= 0 || fsync_target < target) {
        target = fsync_target;
    }

    let diff = target - now;
    if diff < USECS_PER_SEC {
        return Duration::from_secs(1);
    }

    Duration::from_micros(diff as u64)
}
