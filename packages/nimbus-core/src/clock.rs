//! Monotonic+wall event timestamps.
//!
//! Events need a timestamp that is both wall-clock meaningful (for display
//! and TTL math) and strictly ordered within a single process even when two
//! events land in the same millisecond. This mirrors the ordering half of a
//! Hybrid Logical Clock without the causality-merge machinery that only
//! matters across independent nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Source of wall-clock milliseconds, injectable for deterministic tests.
pub trait ClockSource: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Real wall clock, backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A single-process event timestamp: wall-clock millis plus a monotonic
/// sequence number that breaks ties between events in the same millisecond.
///
/// Ordering is `(millis, seq)` lexicographically, which matches the spec's
/// "monotonic+wall" requirement (§3) without needing a node id, since there
/// is exactly one writer per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventTimestamp {
    pub millis: u64,
    pub seq: u64,
}

impl EventTimestamp {
    #[must_use]
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

/// Generates strictly increasing [`EventTimestamp`]s for a single process.
///
/// `seq` only resets logically when `millis` advances; within the same
/// millisecond it keeps climbing, which is what guarantees total order for
/// events that would otherwise tie.
pub struct EventClock {
    source: Box<dyn ClockSource>,
    last_millis: AtomicU64,
    seq: AtomicU64,
}

impl EventClock {
    #[must_use]
    pub fn new(source: impl ClockSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            last_millis: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemClock)
    }

    /// Produces the next timestamp, guaranteed strictly greater than the
    /// previous one returned by this clock.
    pub fn tick(&self) -> EventTimestamp {
        let millis = self.source.now_millis();
        let prev_millis = self.last_millis.fetch_max(millis, Ordering::AcqRel);
        if millis < prev_millis {
            tracing::warn!(millis, prev_millis, "clock source went backwards, clamping to last observed value");
        }
        let seq = if millis > prev_millis {
            self.seq.store(0, Ordering::Release);
            0
        } else {
            self.seq.fetch_add(1, Ordering::AcqRel) + 1
        };
        EventTimestamp::new(millis.max(prev_millis), seq)
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct FixedClock(Arc<Mutex<u64>>);

    impl FixedClock {
        fn new(millis: u64) -> Self {
            Self(Arc::new(Mutex::new(millis)))
        }

        fn set(&self, millis: u64) {
            *self.0.lock().unwrap() = millis;
        }
    }

    impl ClockSource for FixedClock {
        fn now_millis(&self) -> u64 {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn ticks_within_same_millis_increase_seq() {
        let clock = EventClock::new(FixedClock::new(1_000));
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.millis, 1_000);
        assert_eq!(b.seq, a.seq + 1);
    }

    #[test]
    fn millis_advance_resets_seq_but_preserves_order() {
        let source = FixedClock::new(1_000);
        let clock = EventClock::new(source.clone());
        let a = clock.tick();
        source.set(2_000);
        let b = clock.tick();
        assert!(a < b);
        assert_eq!(b.millis, 2_000);
        assert_eq!(b.seq, 0);
    }

    #[test]
    fn clock_never_goes_backwards_even_if_source_does() {
        struct Flaky(Mutex<Vec<u64>>);
        impl ClockSource for Flaky {
            fn now_millis(&self) -> u64 {
                self.0.lock().unwrap().remove(0)
            }
        }
        let clock = EventClock::new(Flaky(Mutex::new(vec![5_000, 4_000, 4_000])));
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b);
        assert!(b < c);
    }
}
