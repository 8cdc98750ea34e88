use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use super::{DecodeError, FieldCodec};

// ============================================================================
// Timestamp
// ============================================================================

/// A point in time with whole-second precision.
///
/// Construction validates that the value is representable as a
/// `chrono::DateTime<Utc>`, which is what keeps [`TimestampCodec`] total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// 1970-01-01T00:00:00Z
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Build a timestamp from seconds since the Unix epoch.
    pub fn from_epoch_secs(secs: i64) -> Result<Self, DecodeError> {
        match DateTime::<Utc>::from_timestamp(secs, 0) {
            Some(_) => Ok(Self(secs)),
            None => Err(DecodeError::OutOfRange {
                field: "timestamp",
                value: secs,
            }),
        }
    }

    /// The current wall-clock time, truncated to the second.
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn as_epoch_secs(self) -> i64 {
        self.0
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.0, 0).unwrap_or_default()
    }

    /// Move back by `secs`, clamping at the epoch.
    pub fn saturating_sub_secs(self, secs: u64) -> Self {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(secs).max(0))
    }

    /// Time elapsed since `earlier`, or zero when `earlier` is in the future.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_secs(u64::try_from(self.0.saturating_sub(earlier.0)).unwrap_or(0))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp())
    }
}

impl TryFrom<i64> for Timestamp {
    type Error = DecodeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_epoch_secs(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// Timestamps as integer seconds since the epoch.
pub struct TimestampCodec;

impl FieldCodec for TimestampCodec {
    type Value = Timestamp;
    type Scalar = i64;

    fn encode(value: &Timestamp) -> i64 {
        value.0
    }

    fn decode(scalar: &i64) -> Result<Timestamp, DecodeError> {
        Timestamp::from_epoch_secs(*scalar)
    }
}

serde_via_codec!(Timestamp, TimestampCodec, i64);

// ============================================================================
// Seconds
// ============================================================================

/// A non-negative span in whole seconds (episode durations and playback
/// positions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seconds(u32);

impl Seconds {
    pub const ZERO: Seconds = Seconds(0);

    pub const fn new(secs: u32) -> Self {
        Self(secs)
    }

    pub const fn as_secs(self) -> u32 {
        self.0
    }

    pub fn saturating_add(self, other: Seconds) -> Seconds {
        Seconds(self.0.saturating_add(other.0))
    }

    pub fn to_duration(self) -> Duration {
        Duration::from_secs(u64::from(self.0))
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, m, s) = (self.0 / 3600, (self.0 / 60) % 60, self.0 % 60);
        if h > 0 {
            write!(f, "{}:{:02}:{:02}", h, m, s)
        } else {
            write!(f, "{}:{:02}", m, s)
        }
    }
}

/// Durations and positions as integer seconds. Negative values and values
/// beyond `u32::MAX` are rejected.
pub struct SecondsCodec;

impl FieldCodec for SecondsCodec {
    type Value = Seconds;
    type Scalar = i64;

    fn encode(value: &Seconds) -> i64 {
        i64::from(value.0)
    }

    fn decode(scalar: &i64) -> Result<Seconds, DecodeError> {
        u32::try_from(*scalar)
            .map(Seconds)
            .map_err(|_| DecodeError::OutOfRange {
                field: "seconds",
                value: *scalar,
            })
    }
}

serde_via_codec!(Seconds, SecondsCodec, i64);
