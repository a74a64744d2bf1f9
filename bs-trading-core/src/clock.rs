//! Time source for settlement timers
//!
//! Containers never read the system clock directly. The session injects a
//! [`Clock`], which lets tests step time forward deterministically.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Monotonic wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One-shot deadline armed against a [`Clock`]
#[derive(Debug, Default, Clone, Copy)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    pub fn start(&mut self, clock: &dyn Clock, after: Duration) {
        self.expires_at = Some(clock.now() + after);
    }

    pub fn stop(&mut self) {
        self.expires_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.expires_at.is_some()
    }

    /// Armed and not yet elapsed
    pub fn is_live(&self, clock: &dyn Clock) -> bool {
        matches!(self.expires_at, Some(at) if clock.now() < at)
    }

    /// Armed and elapsed
    pub fn has_expired(&self, clock: &dyn Clock) -> bool {
        matches!(self.expires_at, Some(at) if clock.now() >= at)
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(clock.now()))
    }
}
