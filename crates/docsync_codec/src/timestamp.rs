//! Logical timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A point in time with nanosecond precision.
///
/// Ordering is by `seconds`, then `nanos`. `nanos` is always in
/// `0..1_000_000_000`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Non-negative fraction of a second.
    pub nanos: i32,
}

impl Timestamp {
    /// The smallest representable timestamp, used as "no version".
    pub const MIN: Timestamp = Timestamp {
        seconds: 0,
        nanos: 0,
    };

    /// Creates a timestamp from seconds and nanoseconds, normalizing the
    /// nanoseconds into range.
    pub fn new(seconds: i64, nanos: i64) -> Self {
        let seconds = seconds + nanos.div_euclid(NANOS_PER_SECOND);
        let nanos = nanos.rem_euclid(NANOS_PER_SECOND) as i32;
        Self { seconds, nanos }
    }

    /// Returns the current wall clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }

    /// Creates a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self::new(0, millis * 1_000_000)
    }

    /// Creates a timestamp from microseconds since the epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self::new(0, micros * 1_000)
    }

    /// Milliseconds since the epoch, truncated.
    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos) / 1_000_000
    }

    /// Microseconds since the epoch, truncated.
    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos) / 1_000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "time({},{})", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_nanos() {
        assert_eq!(Timestamp::new(1, 1_500_000_000), Timestamp::new(2, 500_000_000));
        assert_eq!(
            Timestamp::new(1, -1),
            Timestamp {
                seconds: 0,
                nanos: 999_999_999
            }
        );
    }

    #[test]
    fn millis_roundtrip_and_order() {
        let t = Timestamp::from_millis(1_234);
        assert_eq!(t.to_millis(), 1_234);
        assert_eq!(t.to_micros(), 1_234_000);
        assert!(Timestamp::from_millis(1) < Timestamp::from_millis(2));
        assert!(Timestamp::MIN < Timestamp::now());
    }
}
