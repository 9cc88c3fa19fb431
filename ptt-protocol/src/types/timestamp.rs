/// Timestamps and the process clock.
///
/// `Timestamp` is a `(seconds, nanoseconds)` pair ordered field by field.
/// `Clock` adds a single configurable offset to wall time so tests and
/// operators can move the node forward (`--offset-second`, `ptt_setOffsetSecond`).
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp {
    #[serde(rename = "T")]
    pub ts: i64,
    #[serde(rename = "NT")]
    pub nano_ts: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { ts: 0, nano_ts: 0 };

    pub fn new(ts: i64, nano_ts: u32) -> Self {
        Timestamp { ts, nano_ts }
    }

    pub fn from_seconds(ts: i64) -> Self {
        Timestamp { ts, nano_ts: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.ts == 0 && self.nano_ts == 0
    }

    pub fn plus_seconds(&self, secs: i64) -> Self {
        Timestamp {
            ts: self.ts.saturating_add(secs),
            nano_ts: self.nano_ts,
        }
    }

    pub fn minus_seconds(&self, secs: i64) -> Self {
        self.plus_seconds(-secs)
    }

    /// Start of the `window`-second bucket containing this timestamp.
    pub fn bucket_start(&self, window: i64) -> i64 {
        if window <= 0 {
            return self.ts;
        }
        self.ts.div_euclid(window) * window
    }

    /// Big-endian bytes, ordered like the timestamp itself for `ts >= 0`.
    pub fn to_be_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..8].copy_from_slice(&self.ts.to_be_bytes());
        out[8..].copy_from_slice(&self.nano_ts.to_be_bytes());
        out
    }

    /// RFC 3339 form for diagnostics.
    pub fn to_rfc3339(&self) -> String {
        match Utc.timestamp_opt(self.ts, self.nano_ts).single() {
            Some(dt) => dt.to_rfc3339(),
            None => format!("{}.{:09}", self.ts, self.nano_ts),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}.{:09})", self.ts, self.nano_ts)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall clock plus a process-wide offset in seconds.
///
/// Threaded through the node context; never a global.
#[derive(Debug, Default)]
pub struct Clock {
    offset_second: AtomicI64,
    frozen: Option<Timestamp>,
}

impl Clock {
    pub fn new(offset_second: i64) -> Self {
        Clock {
            offset_second: AtomicI64::new(offset_second),
            frozen: None,
        }
    }

    /// A clock pinned at `at` (plus offset). Used by tests that need exact times.
    pub fn frozen(at: Timestamp) -> Self {
        Clock {
            offset_second: AtomicI64::new(0),
            frozen: Some(at),
        }
    }

    pub fn now(&self) -> Timestamp {
        let base = match self.frozen {
            Some(at) => at,
            None => {
                let now = Utc::now();
                Timestamp::new(now.timestamp(), now.timestamp_subsec_nanos())
            }
        };
        base.plus_seconds(self.offset_second.load(Ordering::SeqCst))
    }

    pub fn offset_second(&self) -> i64 {
        self.offset_second.load(Ordering::SeqCst)
    }

    pub fn set_offset_second(&self, offset: i64) {
        log::info!("clock offset set to {}s", offset);
        self.offset_second.store(offset, Ordering::SeqCst);
    }

    /// Move the clock forward by `secs` on top of the current offset.
    pub fn advance(&self, secs: i64) {
        self.offset_second.fetch_add(secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_seconds_then_nanos() {
        let a = Timestamp::new(10, 999);
        let b = Timestamp::new(11, 0);
        let c = Timestamp::new(11, 5);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_bucket_start() {
        assert_eq!(Timestamp::from_seconds(125).bucket_start(60), 120);
        assert_eq!(Timestamp::from_seconds(120).bucket_start(60), 120);
        assert_eq!(Timestamp::from_seconds(-1).bucket_start(60), -60);
    }

    #[test]
    fn test_offset_applies_to_now() {
        let base = Timestamp::new(1_000_000, 7);
        let clock = Clock::frozen(base);
        assert_eq!(clock.now(), base);
        clock.set_offset_second(8 * 86400);
        assert_eq!(clock.now(), base.plus_seconds(8 * 86400));
        clock.advance(5);
        assert_eq!(clock.offset_second(), 8 * 86400 + 5);
    }

    #[test]
    fn test_wall_clock_offset_within_epsilon() {
        let clock = Clock::new(0);
        let before = clock.now();
        clock.set_offset_second(3600);
        let after = clock.now();
        let delta = after.ts - before.ts;
        assert!((3599..=3602).contains(&delta));
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_string(&Timestamp::new(3, 4)).unwrap();
        assert_eq!(json, r#"{"T":3,"NT":4}"#);
    }
}
