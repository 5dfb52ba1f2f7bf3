use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::{error::ClockError, lock_unpoisoned};

pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancels a pending timer. Dropping the handle leaves the timer armed.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Guarantees the callback will not start after this returns. A callback
    /// that already started runs to completion.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

const TIMER_PENDING: u8 = 0;
const TIMER_STARTED: u8 = 1;
const TIMER_CANCELLED: u8 = 2;

#[derive(Clone)]
pub struct SystemClock {
    runtime: Handle,
}

impl SystemClock {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn current() -> Result<Self, ClockError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| ClockError::NoRuntime)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let state = Arc::new(AtomicU8::new(TIMER_PENDING));
        let task_state = Arc::clone(&state);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if task_state
                .compare_exchange(
                    TIMER_PENDING,
                    TIMER_STARTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                callback().await;
            }
        });
        let abort = task.abort_handle();
        TimerHandle::new(move || {
            if state
                .compare_exchange(
                    TIMER_PENDING,
                    TIMER_CANCELLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                abort.abort();
            }
        })
    }
}

#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualClockState>>,
}

struct ManualClockState {
    origin: Instant,
    elapsed: Duration,
    next_timer_id: u64,
    timers: BTreeMap<(Duration, u64), TimerCallback>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualClockState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                next_timer_id: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    pub fn elapsed(&self) -> Duration {
        lock_unpoisoned(&self.inner).elapsed
    }

    pub fn pending_timers(&self) -> usize {
        lock_unpoisoned(&self.inner).timers.len()
    }

    /// Moves time forward by `delta`, running every timer that comes due in
    /// deadline order. Each callback observes `now()` equal to its own
    /// deadline; timers armed by a callback fire in the same pass when they
    /// fall inside the window.
    pub async fn advance(&self, delta: Duration) {
        let target = lock_unpoisoned(&self.inner).elapsed + delta;
        loop {
            let due = {
                let mut state = lock_unpoisoned(&self.inner);
                let next_key = state
                    .timers
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match next_key {
                    Some(key) => {
                        state.elapsed = state.elapsed.max(key.0);
                        state.timers.remove(&key)
                    }
                    None => None,
                }
            };
            match due {
                Some(callback) => callback().await,
                None => break,
            }
        }
        lock_unpoisoned(&self.inner).elapsed = target;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = lock_unpoisoned(&self.inner);
        state.origin + state.elapsed
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let key = {
            let mut state = lock_unpoisoned(&self.inner);
            let key = (state.elapsed + delay, state.next_timer_id);
            state.next_timer_id += 1;
            state.timers.insert(key, callback);
            key
        };
        let inner: Weak<Mutex<ManualClockState>> = Arc::downgrade(&self.inner);
        TimerHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock_unpoisoned(&inner).timers.remove(&key);
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/clock_tests.rs"]
mod tests;
