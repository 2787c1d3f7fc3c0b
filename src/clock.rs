//! Monotonically non-decreasing wall-clock source (spec.md §2).

use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        now.as_millis() as i64
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Deterministic clock for tests; `advance` moves time forward,
    /// never backward, matching the "monotonically non-decreasing"
    /// contract of the real clock.
    #[derive(Debug, Default)]
    pub struct FakeClock {
        millis: AtomicI64,
    }

    impl FakeClock {
        pub fn new(start: i64) -> Self {
            Self {
                millis: AtomicI64::new(start),
            }
        }

        pub fn advance(&self, delta: i64) {
            self.millis.fetch_add(delta.max(0), Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_millis(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}
