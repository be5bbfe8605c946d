//! Timeline completion signals.
//!
//! A timeline signal is a monotonically increasing counter. Producers advance it as work retires;
//! waiters block until it reaches a target value. Streams use one signal each: command `n`
//! completing sets the signal to `n`, so "drained up to ticket `t`" is `signal >= t`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeSnafu};

/// Monotonic timeline signal.
pub trait TimelineSignal: Send + Sync + std::fmt::Debug {
    /// Current value.
    fn value(&self) -> u64;

    /// Advance to `value`. Values lower than the current one are ignored.
    fn set(&self, value: u64);

    /// Block until the signal reaches `target`, or fail once `timeout` elapses (`None` waits forever).
    fn wait(&self, target: u64, timeout: Option<Duration>) -> Result<()>;

    fn is_reached(&self, target: u64) -> bool {
        self.value() >= target
    }
}

/// Host-side timeline signal backed by an atomic counter and a condvar.
#[derive(Debug, Default)]
pub struct HostSignal {
    value: AtomicU64,
    // Protects nothing; pairs with the condvar so a `set` between check and park is not missed.
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl HostSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimelineSignal for HostSignal {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        let _guard = self.mutex.lock();
        self.value.fetch_max(value, Ordering::AcqRel);
        self.condvar.notify_all();
    }

    fn wait(&self, target: u64, timeout: Option<Duration>) -> Result<()> {
        if self.is_reached(target) {
            return Ok(());
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut guard = self.mutex.lock();
        while !self.is_reached(target) {
            match deadline {
                None => self.condvar.wait(&mut guard),
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() && !self.is_reached(target) {
                        return RuntimeSnafu {
                            message: format!(
                                "timeline signal timeout: waited {:?} for value {target}, current {}",
                                timeout.unwrap_or_default(),
                                self.value()
                            ),
                        }
                        .fail();
                    }
                }
            }
        }
        Ok(())
    }
}
