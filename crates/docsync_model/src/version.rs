//! Timestamps and snapshot versions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point in time with nanosecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: i64,
    /// Non-negative nanoseconds within the second.
    pub nanos: i32,
}

impl Timestamp {
    /// Creates a timestamp, normalizing out-of-range nanos.
    #[must_use]
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let total = i128::from(seconds) * i128::from(NANOS_PER_SECOND) + i128::from(nanos);
        Self::from_total_nanos(total)
    }

    fn from_total_nanos(total: i128) -> Self {
        let per = i128::from(NANOS_PER_SECOND);
        Self {
            seconds: total.div_euclid(per) as i64,
            nanos: total.rem_euclid(per) as i32,
        }
    }

    /// Returns the current wall clock time.
    #[must_use]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs() as i64,
            nanos: since_epoch.subsec_nanos() as i32,
        }
    }

    /// Creates a timestamp from microseconds since the epoch.
    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        Self::from_total_nanos(i128::from(micros) * 1_000)
    }

    /// Returns microseconds since the epoch.
    #[must_use]
    pub fn to_micros(self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos) / 1_000
    }

    /// Returns this timestamp moved forward by `duration`.
    #[must_use]
    pub fn add_duration(self, duration: Duration) -> Self {
        let total = i128::from(self.seconds) * i128::from(NANOS_PER_SECOND)
            + i128::from(self.nanos)
            + duration.as_nanos() as i128;
        Self::from_total_nanos(total)
    }

    /// Returns the time elapsed from `earlier` to this timestamp, or zero.
    #[must_use]
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let per = i128::from(NANOS_PER_SECOND);
        let diff = (i128::from(self.seconds) * per + i128::from(self.nanos))
            - (i128::from(earlier.seconds) * per + i128::from(earlier.nanos));
        if diff <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(diff as u64)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}

/// A version of a document or of a watch snapshot as assigned by the backend.
///
/// [`SnapshotVersion::MIN`] means "unknown point in time".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    /// The smallest version; used as the "unknown" sentinel.
    pub const MIN: SnapshotVersion = SnapshotVersion(Timestamp { seconds: 0, nanos: 0 });

    /// Wraps a timestamp.
    #[must_use]
    pub const fn from_timestamp(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Creates a version from microseconds; handy in tests.
    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::from_micros(micros))
    }

    /// Returns the underlying timestamp.
    #[must_use]
    pub const fn timestamp(self) -> Timestamp {
        self.0
    }

    /// Returns the version as microseconds.
    #[must_use]
    pub fn to_micros(self) -> i64 {
        self.0.to_micros()
    }

    /// Returns true for the MIN sentinel.
    #[must_use]
    pub fn is_min(self) -> bool {
        self == Self::MIN
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}
