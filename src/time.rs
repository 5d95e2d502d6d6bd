use std::fmt::Debug;
use std::sync::RwLock;
use std::time::Instant;

/// Source of local time, in seconds since some fixed origin.
///
/// The ensemble reads all local time through this trait so that clock-sync
/// and scheduler behavior can be driven deterministically in tests. The
/// origin is arbitrary; only differences matter.
pub trait TimeProvider: Send + Sync + Debug {
    fn now(&self) -> f64;
}

/// Default provider: monotonic time since creation.
#[derive(Debug)]
pub struct SystemTimeProvider {
    start: Instant,
}

impl SystemTimeProvider {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: RwLock<f64>,
}

impl ManualTimeProvider {
    pub fn new(start: f64) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set_time(&self, t: f64) {
        *self.now.write().unwrap() = t;
    }

    pub fn advance(&self, dt: f64) {
        *self.now.write().unwrap() += dt;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> f64 {
        *self.now.read().unwrap()
    }
}
