//! State provider id allocation.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use txnrep_common::StateProviderId;

/// Source of the wall-clock seed for new ids
pub trait IdClock: Send + Sync {
    /// Current time in 100ns ticks
    fn now_ticks(&self) -> i64;
}

/// Wall clock backed by `chrono`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl IdClock for SystemClock {
    fn now_ticks(&self) -> i64 {
        Utc::now().timestamp_micros().saturating_mul(10)
    }
}

/// Manually driven clock
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(ticks: i64) -> Self {
        Self {
            ticks: AtomicI64::new(ticks),
        }
    }

    pub fn set(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }
}

impl IdClock for ManualClock {
    fn now_ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Hands out strictly increasing ids seeded from the clock
pub struct IdAllocator {
    clock: Arc<dyn IdClock>,
    last: Mutex<i64>,
}

impl IdAllocator {
    pub fn new(clock: Arc<dyn IdClock>) -> Self {
        Self {
            clock,
            last: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Next id: the current time, or one past the last id if the clock has not moved
    pub fn next(&self) -> StateProviderId {
        let now = self.clock.now_ticks();
        let mut last = self.last.lock();
        if now > *last {
            *last = now;
        } else {
            *last += 1;
        }
        StateProviderId::new(*last)
    }

    /// Make sure future ids exceed `id`, used when ids arrive through replication
    pub fn update_last_id(&self, id: StateProviderId) {
        let mut last = self.last.lock();
        if id.as_i64() > *last {
            *last = id.as_i64();
        }
    }

    #[must_use]
    pub fn last_id(&self) -> StateProviderId {
        StateProviderId::new(*self.last.lock())
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::system()
    }
}
