//! Hybrid logical clock.
//!
//! A [`Timestamp`] orders every change in the system by
//! `(millis, counter, replica)`. A replica's [`LogicalClock`] hands out
//! strictly increasing timestamps even when the wall clock stalls or runs
//! backwards, and is advanced past any remote timestamp it observes so later
//! local writes stay causally after what the replica has seen.
//!
//! The clock holds no hidden global state: the caller passes the wall-clock
//! reading in, usually from a [`TimeSource`].

use crate::ids::ReplicaId;
use chrono::{NaiveDateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// First millisecond of the year 10000. Timestamps must be strictly below it.
pub const MAX_MILLIS: u64 = 253_402_300_800_000;

/// Default bound on how far a clock may run ahead of the wall clock.
pub const DEFAULT_MAX_DRIFT: Duration = Duration::from_secs(5 * 60);

/// Encoded size of a timestamp: millis (8) + counter (2) + replica (16).
pub const TIMESTAMP_LEN: usize = 26;

const ISO_LEN: usize = 24;
const STRING_LEN: usize = ISO_LEN + 1 + 4 + 1 + 32;

/// Result alias for clock operations.
pub type ClockResult<T> = Result<T, ClockError>;

/// Clock failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// More than 65 536 timestamps were requested within one millisecond.
    #[error("timestamp counter overflow at {millis}ms")]
    CounterOverflow {
        /// Millisecond whose counter ran out.
        millis: u64,
    },

    /// The local clock would run too far ahead of the wall clock.
    #[error("clock drift: {ahead_ms}ms ahead of wall clock (limit {max_drift_ms}ms)")]
    ClockDrift {
        /// How far the clock would be ahead.
        ahead_ms: u64,
        /// Configured limit.
        max_drift_ms: u64,
    },

    /// A remote timestamp is too far in the future to adopt.
    #[error("clock skew: remote timestamp {remote} is {ahead_ms}ms ahead of wall clock (limit {max_drift_ms}ms)")]
    ClockSkew {
        /// The offending timestamp.
        remote: Timestamp,
        /// How far it is ahead.
        ahead_ms: u64,
        /// Configured limit.
        max_drift_ms: u64,
    },

    /// The bytes or text do not describe a valid timestamp.
    #[error("invalid timestamp: {0}")]
    Invalid(String),
}

impl ClockError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// A point in the global order of changes.
///
/// Field order matters: the derived `Ord` compares millis, then counter, then
/// replica bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    millis: u64,
    counter: u16,
    replica: ReplicaId,
}

impl Timestamp {
    /// Creates a timestamp without range checks.
    #[must_use]
    pub const fn new(millis: u64, counter: u16, replica: ReplicaId) -> Self {
        Self {
            millis,
            counter,
            replica,
        }
    }

    /// The smallest timestamp.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0, ReplicaId::NIL)
    }

    /// The largest valid timestamp.
    #[must_use]
    pub const fn max() -> Self {
        Self::new(MAX_MILLIS - 1, u16::MAX, ReplicaId::from_bytes([0xff; 16]))
    }

    /// Smallest timestamp at `millis`; lower bound for range scans.
    #[must_use]
    pub const fn floor(millis: u64) -> Self {
        Self::new(millis, 0, ReplicaId::NIL)
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub const fn millis(&self) -> u64 {
        self.millis
    }

    /// Tie-breaker within one millisecond.
    #[must_use]
    pub const fn counter(&self) -> u16 {
        self.counter
    }

    /// Replica that issued or last merged this timestamp.
    #[must_use]
    pub const fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Big-endian encoding: millis, counter, replica.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_LEN] {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..8].copy_from_slice(&self.millis.to_be_bytes());
        out[8..10].copy_from_slice(&self.counter.to_be_bytes());
        out[10..].copy_from_slice(self.replica.as_bytes());
        out
    }

    /// Decodes [`to_bytes`](Self::to_bytes) output.
    ///
    /// # Errors
    ///
    /// Fails on a wrong length or millis at or beyond [`MAX_MILLIS`].
    pub fn from_bytes(bytes: &[u8]) -> ClockResult<Self> {
        if bytes.len() != TIMESTAMP_LEN {
            return Err(ClockError::invalid(format!(
                "expected {TIMESTAMP_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&bytes[..8]);
        let millis = u64::from_be_bytes(millis);
        if millis >= MAX_MILLIS {
            return Err(ClockError::invalid(format!("millis {millis} out of range")));
        }
        let counter = u16::from_be_bytes([bytes[8], bytes[9]]);
        let mut replica = [0u8; 16];
        replica.copy_from_slice(&bytes[10..]);
        Ok(Self::new(millis, counter, ReplicaId::from_bytes(replica)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = i64::try_from(self.millis)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        match when {
            Some(when) => write!(f, "{}", when.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?,
            None => write!(f, "{}ms", self.millis)?,
        }
        write!(f, "-{:04X}-{}", self.counter, self.replica.to_hex())
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({self})")
    }
}

impl FromStr for Timestamp {
    type Err = ClockError;

    /// Parses `YYYY-MM-DDTHH:MM:SS.mmmZ-CCCC-<32 hex replica>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() || s.len() != STRING_LEN {
            return Err(ClockError::invalid(format!("malformed timestamp {s:?}")));
        }
        let bytes = s.as_bytes();
        if bytes[ISO_LEN] != b'-' || bytes[ISO_LEN + 5] != b'-' {
            return Err(ClockError::invalid(format!("malformed timestamp {s:?}")));
        }
        let iso = &s[..ISO_LEN];
        let counter = &s[ISO_LEN + 1..ISO_LEN + 5];
        let replica = &s[ISO_LEN + 6..];

        let naive = NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S%.3fZ")
            .map_err(|e| ClockError::invalid(format!("bad date {iso:?}: {e}")))?;
        let millis = u64::try_from(Utc.from_utc_datetime(&naive).timestamp_millis())
            .map_err(|_| ClockError::invalid(format!("date {iso:?} is before the epoch")))?;
        if millis >= MAX_MILLIS {
            return Err(ClockError::invalid(format!("date {iso:?} out of range")));
        }
        let counter = u16::from_str_radix(counter, 16)
            .map_err(|_| ClockError::invalid(format!("bad counter {counter:?}")))?;
        let replica = ReplicaId::from_hex(replica)
            .ok_or_else(|| ClockError::invalid(format!("bad replica id {replica:?}")))?;
        Ok(Self::new(millis, counter, replica))
    }
}

/// A replica's clock state.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    last: Timestamp,
    max_drift_ms: u64,
}

impl LogicalClock {
    /// A fresh clock for `replica` that has issued nothing.
    #[must_use]
    pub fn new(replica: ReplicaId) -> Self {
        Self::restore(Timestamp::new(0, 0, replica))
    }

    /// Resumes a clock from its last persisted timestamp.
    #[must_use]
    pub fn restore(last: Timestamp) -> Self {
        Self {
            last,
            max_drift_ms: DEFAULT_MAX_DRIFT.as_millis() as u64,
        }
    }

    /// Sets the bound on future drift and skew.
    #[must_use]
    pub fn with_max_drift(mut self, max_drift: Duration) -> Self {
        self.max_drift_ms = u64::try_from(max_drift.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The replica this clock stamps for.
    #[must_use]
    pub fn replica(&self) -> ReplicaId {
        self.last.replica
    }

    /// Last issued or merged timestamp.
    #[must_use]
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Drift bound in milliseconds.
    #[must_use]
    pub fn max_drift_ms(&self) -> u64 {
        self.max_drift_ms
    }

    /// Issues a timestamp for a local write.
    ///
    /// The result is strictly greater than every timestamp this clock issued
    /// or merged before, whatever the wall clock does.
    ///
    /// # Errors
    ///
    /// [`ClockError::ClockDrift`] if the clock would run more than the drift
    /// bound ahead of `wall_ms`; [`ClockError::CounterOverflow`] when one
    /// millisecond is exhausted. The clock is unchanged on error.
    pub fn now(&mut self, wall_ms: u64) -> ClockResult<Timestamp> {
        let last = self.last;
        let millis = wall_ms.max(last.millis);
        let counter = if millis == last.millis {
            u32::from(last.counter) + 1
        } else {
            0
        };
        self.commit(millis, counter, wall_ms)
    }

    /// Advances the clock past `remote`.
    ///
    /// # Errors
    ///
    /// [`ClockError::ClockSkew`] if `remote` is more than the drift bound
    /// ahead of `wall_ms`; otherwise the same errors as [`now`](Self::now).
    /// The clock is unchanged on error.
    pub fn merge(&mut self, remote: &Timestamp, wall_ms: u64) -> ClockResult<Timestamp> {
        self.check_skew(remote, wall_ms)?;
        let last = self.last;
        let millis = last.millis.max(wall_ms).max(remote.millis);
        let counter = match (millis == last.millis, millis == remote.millis) {
            (true, true) => u32::from(last.counter.max(remote.counter)) + 1,
            (true, false) => u32::from(last.counter) + 1,
            (false, true) => u32::from(remote.counter) + 1,
            (false, false) => 0,
        };
        self.commit(millis, counter, wall_ms)
    }

    /// Checks whether `remote` could be merged without tripping the skew bound.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::ClockSkew`] if it could not.
    pub fn check_skew(&self, remote: &Timestamp, wall_ms: u64) -> ClockResult<()> {
        let ahead_ms = remote.millis.saturating_sub(wall_ms);
        if ahead_ms > self.max_drift_ms {
            return Err(ClockError::ClockSkew {
                remote: *remote,
                ahead_ms,
                max_drift_ms: self.max_drift_ms,
            });
        }
        Ok(())
    }

    fn commit(&mut self, millis: u64, counter: u32, wall_ms: u64) -> ClockResult<Timestamp> {
        let ahead_ms = millis.saturating_sub(wall_ms);
        if ahead_ms > self.max_drift_ms {
            return Err(ClockError::ClockDrift {
                ahead_ms,
                max_drift_ms: self.max_drift_ms,
            });
        }
        let counter = u16::try_from(counter).map_err(|_| ClockError::CounterOverflow { millis })?;
        self.last = Timestamp::new(millis, counter, self.last.replica);
        Ok(self.last)
    }
}

/// Source of wall-clock readings in milliseconds since the epoch.
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now_millis(&self) -> u64;
}

/// Reads the operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A settable clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    millis: AtomicU64,
}

impl ManualTimeSource {
    /// Starts at `millis`.
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    /// Jumps to `millis`, which may be in the past.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Moves forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> ReplicaId {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        ReplicaId::from_bytes(bytes)
    }

    /// Parses a timestamp written with a 16-digit node id, widening it.
    fn ts(text: &str) -> Timestamp {
        let (head, node) = text.rsplit_once('-').unwrap();
        format!("{head}-{node:0>32}").parse().unwrap()
    }

    fn clock() -> LogicalClock {
        LogicalClock::new(node(1))
    }

    #[test]
    fn ordering_of_special_values() {
        let mut clock = clock();
        assert_eq!(Timestamp::zero(), Timestamp::zero());
        assert!(Timestamp::max() > Timestamp::zero());
        let sent = clock.now(0).unwrap();
        assert!(sent > Timestamp::zero());
        assert!(sent < Timestamp::max());
    }

    #[test]
    fn counter_then_replica_break_ties() {
        let a = Timestamp::new(5, 1, node(9));
        let b = Timestamp::new(5, 2, node(1));
        let c = Timestamp::new(5, 2, node(2));
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn rejects_malformed_strings() {
        let invalid = [
            "",
            " ",
            "0",
            "invalid",
            "1969-1-1T0:0:0.0Z-0-0-0",
            "1969-01-01T00:00:00.000Z-0000-00000000000000000000000000000000",
            "10000-01-01T00:00:00.000Z-FFFF-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF",
            "9999-12-31T23:59:59.999Z-10000-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF",
            "9999-12-31T23:59:59.999Z-FFFF-1FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF",
            "2015-13-24T22:23:42.123Z-1000-0123456789ABCDEF0123456789ABCDEF",
        ];
        for input in invalid {
            assert!(input.parse::<Timestamp>().is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn parses_and_prints_valid_strings() {
        let valid = [
            "1970-01-01T00:00:00.000Z-0000-00000000000000000000000000000000",
            "2015-04-24T22:23:42.123Z-1000-0123456789ABCDEF0123456789ABCDEF",
            "9999-12-31T23:59:59.999Z-FFFF-FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF",
        ];
        for input in valid {
            let parsed: Timestamp = input.parse().unwrap();
            assert!(parsed.millis() < MAX_MILLIS);
            assert_eq!(parsed.to_string(), input);
        }
    }

    #[test]
    fn byte_encoding_sorts_like_timestamps() {
        let a = ts("2015-04-24T22:23:42.123Z-0001-0000000000000002");
        let b = ts("2015-04-24T22:23:42.123Z-0002-0000000000000001");
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(Timestamp::from_bytes(&b.to_bytes()).unwrap(), b);
        assert!(Timestamp::from_bytes(&[0u8; 10]).is_err());

        let mut bad = b.to_bytes();
        bad[..8].copy_from_slice(&MAX_MILLIS.to_be_bytes());
        assert!(Timestamp::from_bytes(&bad).is_err());
    }

    #[test]
    fn now_with_monotonic_wall_clock() {
        let mut clock = clock();
        assert_eq!(clock.now(10).unwrap(), ts("1970-01-01T00:00:00.010Z-0000-0000000000000001"));
        assert_eq!(clock.now(11).unwrap(), ts("1970-01-01T00:00:00.011Z-0000-0000000000000001"));
        assert_eq!(clock.now(12).unwrap(), ts("1970-01-01T00:00:00.012Z-0000-0000000000000001"));
    }

    #[test]
    fn now_with_stuttering_wall_clock() {
        let mut clock = clock();
        assert_eq!(clock.now(20).unwrap(), ts("1970-01-01T00:00:00.020Z-0000-0000000000000001"));
        assert_eq!(clock.now(20).unwrap(), ts("1970-01-01T00:00:00.020Z-0001-0000000000000001"));
        assert_eq!(clock.now(20).unwrap(), ts("1970-01-01T00:00:00.020Z-0002-0000000000000001"));
        assert_eq!(clock.now(21).unwrap(), ts("1970-01-01T00:00:00.021Z-0000-0000000000000001"));
    }

    #[test]
    fn now_with_regressing_wall_clock() {
        let mut clock = clock();
        assert_eq!(clock.now(30).unwrap(), ts("1970-01-01T00:00:00.030Z-0000-0000000000000001"));
        assert_eq!(clock.now(29).unwrap(), ts("1970-01-01T00:00:00.030Z-0001-0000000000000001"));
        assert_eq!(clock.now(29).unwrap(), ts("1970-01-01T00:00:00.030Z-0002-0000000000000001"));
        assert_eq!(clock.now(31).unwrap(), ts("1970-01-01T00:00:00.031Z-0000-0000000000000001"));
    }

    #[test]
    fn now_fails_on_counter_overflow() {
        let mut clock = clock();
        for _ in 0..65_536 {
            clock.now(40).unwrap();
        }
        let before = clock.last();
        assert_eq!(clock.now(40), Err(ClockError::CounterOverflow { millis: 40 }));
        assert_eq!(clock.last(), before);
    }

    #[test]
    fn now_fails_when_clock_runs_ahead() {
        let drift = DEFAULT_MAX_DRIFT.as_millis() as u64;
        let mut clock = LogicalClock::restore(Timestamp::new(drift + 1_000 + 1, 0, node(1)));
        assert!(matches!(clock.now(1_000), Err(ClockError::ClockDrift { .. })));
        assert!(clock.now(1_001).is_ok());
    }

    #[test]
    fn merge_with_monotonic_global_clock() {
        let mut clock = clock();
        let cases = [
            (52, "1970-01-01T00:00:00.051Z-0000-0000000000000002", "1970-01-01T00:00:00.052Z-0000-0000000000000001"),
            (54, "1970-01-01T00:00:00.053Z-0000-0000000000000002", "1970-01-01T00:00:00.054Z-0000-0000000000000001"),
            (56, "1970-01-01T00:00:00.055Z-0000-0000000000000002", "1970-01-01T00:00:00.056Z-0000-0000000000000001"),
        ];
        for (wall, remote, expected) in cases {
            assert_eq!(clock.merge(&ts(remote), wall).unwrap(), ts(expected));
        }
    }

    #[test]
    fn merge_with_stuttering_global_clock() {
        let mut clock = clock();
        let cases = [
            (61, "1970-01-01T00:00:00.062Z-0000-0000000000000002", "1970-01-01T00:00:00.062Z-0001-0000000000000001"),
            (62, "1970-01-01T00:00:00.062Z-0001-0000000000000002", "1970-01-01T00:00:00.062Z-0002-0000000000000001"),
            (62, "1970-01-01T00:00:00.062Z-0002-0000000000000002", "1970-01-01T00:00:00.062Z-0003-0000000000000001"),
            (63, "1970-01-01T00:00:00.062Z-0004-0000000000000002", "1970-01-01T00:00:00.063Z-0000-0000000000000001"),
        ];
        for (wall, remote, expected) in cases {
            assert_eq!(clock.merge(&ts(remote), wall).unwrap(), ts(expected));
        }
    }

    #[test]
    fn merge_with_stuttering_local_clock() {
        let mut clock = clock();
        let cases = [
            (73, "1970-01-01T00:00:00.071Z-0000-0000000000000002", "1970-01-01T00:00:00.073Z-0000-0000000000000001"),
            (73, "1970-01-01T00:00:00.072Z-0000-0000000000000002", "1970-01-01T00:00:00.073Z-0001-0000000000000001"),
            (74, "1970-01-01T00:00:00.073Z-0000-0000000000000002", "1970-01-01T00:00:00.074Z-0000-0000000000000001"),
        ];
        for (wall, remote, expected) in cases {
            assert_eq!(clock.merge(&ts(remote), wall).unwrap(), ts(expected));
        }
    }

    #[test]
    fn merge_with_stuttering_remote_clock() {
        let mut clock = clock();
        let cases = [
            (81, "1970-01-01T00:00:00.083Z-0000-0000000000000002", "1970-01-01T00:00:00.083Z-0001-0000000000000001"),
            (82, "1970-01-01T00:00:00.083Z-0001-0000000000000002", "1970-01-01T00:00:00.083Z-0002-0000000000000001"),
            (83, "1970-01-01T00:00:00.083Z-0002-0000000000000002", "1970-01-01T00:00:00.083Z-0003-0000000000000001"),
            (84, "1970-01-01T00:00:00.083Z-0003-0000000000000002", "1970-01-01T00:00:00.084Z-0000-0000000000000001"),
        ];
        for (wall, remote, expected) in cases {
            assert_eq!(clock.merge(&ts(remote), wall).unwrap(), ts(expected));
        }
    }

    #[test]
    fn merge_with_regressing_local_clock() {
        let mut clock = clock();
        let cases = [
            (93, "1970-01-01T00:00:00.091Z-0000-0000000000000002", "1970-01-01T00:00:00.093Z-0000-0000000000000001"),
            (92, "1970-01-01T00:00:00.092Z-0000-0000000000000002", "1970-01-01T00:00:00.093Z-0001-0000000000000001"),
            (91, "1970-01-01T00:00:00.093Z-0000-0000000000000002", "1970-01-01T00:00:00.093Z-0002-0000000000000001"),
        ];
        for (wall, remote, expected) in cases {
            assert_eq!(clock.merge(&ts(remote), wall).unwrap(), ts(expected));
        }
    }

    #[test]
    fn merge_with_regressing_remote_clock() {
        let mut clock = clock();
        let cases = [
            (101, "1970-01-01T00:00:00.103Z-0000-0000000000000002", "1970-01-01T00:00:00.103Z-0001-0000000000000001"),
            (102, "1970-01-01T00:00:00.102Z-0000-0000000000000002", "1970-01-01T00:00:00.103Z-0002-0000000000000001"),
            (103, "1970-01-01T00:00:00.101Z-0000-0000000000000002", "1970-01-01T00:00:00.103Z-0003-0000000000000001"),
        ];
        for (wall, remote, expected) in cases {
            assert_eq!(clock.merge(&ts(remote), wall).unwrap(), ts(expected));
        }
    }

    #[test]
    fn merge_rejects_far_future_timestamp() {
        let mut clock = clock();
        let remote = ts("1980-01-01T00:00:00.101Z-0000-0000000000000002");
        let err = clock.merge(&remote, 103).unwrap_err();
        assert!(matches!(err, ClockError::ClockSkew { .. }));
        assert_eq!(clock.last(), Timestamp::new(0, 0, node(1)));
        assert!(clock.check_skew(&remote, 103).is_err());
    }

    #[test]
    fn drift_bound_is_configurable() {
        let mut clock = clock().with_max_drift(Duration::from_secs(1));
        let remote = Timestamp::new(2_500, 0, node(2));
        assert!(clock.merge(&remote, 1_000).is_err());
        assert!(clock.merge(&remote, 1_500).is_ok());
        assert_eq!(clock.max_drift_ms(), 1_000);
    }

    #[test]
    fn manual_time_source_moves_both_ways() {
        let time = ManualTimeSource::new(100);
        time.advance(5);
        assert_eq!(time.now_millis(), 105);
        time.set(50);
        assert_eq!(time.now_millis(), 50);
        assert!(SystemTimeSource.now_millis() > 0);
    }
}
