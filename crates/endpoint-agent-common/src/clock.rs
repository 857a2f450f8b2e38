//! The sole time source for the core. Every component that reasons about
//! "now" takes a `Arc<dyn Clock>` at construction instead of calling
//! `Utc::now()`/`Instant::now()` directly, so tests can drive time.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Wall-clock time, for timestamps that end up in persisted JSON.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time, for interval math (cooldowns, sliding windows) that
    /// must never go backwards across a clock adjustment.
    fn monotonic_now(&self) -> Instant;
}

/// Production clock: thin wrapper over `chrono`/`std::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock tests can advance deterministically. `monotonic_now` is derived
/// from the fixed `Instant` captured at construction plus the accumulated
/// advance, so elapsed-duration comparisons behave exactly like the real
/// clock without needing `tokio::time::sleep`.
pub struct FakeClock {
    inner: Mutex<FakeClockState>,
}

struct FakeClockState {
    wall: DateTime<Utc>,
    base_instant: Instant,
    advanced: Duration,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeClockState {
                wall: start,
                base_instant: Instant::now(),
                advanced: Duration::ZERO,
            }),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().expect("fake clock mutex poisoned");
        state.wall += chrono::Duration::from_std(by).expect("duration fits in chrono::Duration");
        state.advanced += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut state = self.inner.lock().expect("fake clock mutex poisoned");
        state.wall = at;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().expect("fake clock mutex poisoned").wall
    }

    fn monotonic_now(&self) -> Instant {
        let state = self.inner.lock().expect("fake clock mutex poisoned");
        state.base_instant + state.advanced
    }
}
