use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::session;

/// Identifier of a 5-minute bar, encoded as `yyyymmddHHMM` with the minute
/// floored to a 5-minute boundary.
///
/// The encoding preserves wall-clock ordering, so comparing two buckets from
/// the same session compares their positions in time. A bucket is the
/// idempotency key for signal derivation and the row key for persisted
/// candles and analysis snapshots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimeBucket(i64);

impl TimeBucket {
    /// Bucket for a UTC instant, evaluated on the exchange's wall clock.
    #[must_use]
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self::from_local(ts.with_timezone(&session::EXCHANGE_TZ).naive_local())
    }

    /// Bucket for an exchange-local wall-clock time.
    #[must_use]
    pub fn from_local(dt: NaiveDateTime) -> Self {
        let minute = i64::from(dt.minute()) / 5 * 5;
        Self(
            i64::from(dt.year()) * 100_000_000
                + i64::from(dt.month()) * 1_000_000
                + i64::from(dt.day()) * 10_000
                + i64::from(dt.hour()) * 100
                + minute,
        )
    }

    /// Reconstructs a bucket from its raw encoded value, e.g. a database row.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
