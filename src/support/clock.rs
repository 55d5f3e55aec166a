//! Time and ID generation
//!
//! Wall-clock time, UUID generation and the transaction-ID sequence are
//! reached through small traits so tests can pin them down.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

// ── Clock ──────────────────────────────────────────────────────

/// Source of UTC wall time.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// The real thing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-cranked clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Unix milliseconds rendered as a decimal string, the timestamp form used
/// on every outbound envelope and inside event payloads.
pub fn unix_ms_string(t: DateTime<Utc>) -> String {
    t.timestamp_millis().to_string()
}

// ── ID generation ──────────────────────────────────────────────

/// Source of opaque unique identifiers (event IDs, message IDs).
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

pub type SharedIds = Arc<dyn IdSource>;

/// UUID v4 generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic sequence for tests: `id-1`, `id-2`, ...
#[derive(Debug, Default)]
pub struct SequenceIds {
    counter: AtomicU64,
}

impl IdSource for SequenceIds {
    fn next_id(&self) -> String {
        format!("id-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

// ── Transaction IDs ────────────────────────────────────────────

/// Monotonic per-gateway transaction-ID sequence.
///
/// Seeded from wall-clock seconds so IDs stay unique across restarts of
/// the same gateway as long as restarts are more than a second apart.
pub struct TransactionSequence {
    next: AtomicI64,
}

impl TransactionSequence {
    pub fn seeded_from(clock: &dyn Clock) -> Self {
        Self {
            next: AtomicI64::new(clock.now_utc().timestamp()),
        }
    }

    #[cfg(test)]
    pub fn starting_at(seed: i64) -> Self {
        Self {
            next: AtomicI64::new(seed),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::at(start);
        assert_eq!(clock.now_utc(), start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn unix_ms_is_decimal_string() {
        let t = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        assert_eq!(unix_ms_string(t), "1700000000000");
    }

    #[test]
    fn transaction_sequence_is_monotonic() {
        let seq = TransactionSequence::starting_at(1_700_000_000);
        let a = seq.next();
        let b = seq.next();
        let c = seq.next();
        assert_eq!(a, 1_700_000_000);
        assert_eq!(b, a + 1);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn sequence_ids_are_deterministic() {
        let ids = SequenceIds::default();
        assert_eq!(ids.next_id(), "id-1");
        assert_eq!(ids.next_id(), "id-2");
    }
}
