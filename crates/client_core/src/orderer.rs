use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use shared::domain::{InboxVersion, UserId};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, TimerHandle},
    inbox_version::InboxVersionStore,
    lock_unpoisoned,
};

pub type DeliverFn = Box<dyn FnOnce(DeliveryMode) -> BoxFuture<'static, ()> + Send>;

pub const DEFAULT_BACKLOG: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    InOrder,
    /// Delivered past an unfilled gap after the timeout elapsed.
    Forced,
}

#[derive(Clone)]
pub struct InboxVersionOrderer {
    inner: Arc<OrdererInner>,
}

struct OrdererInner {
    store: Arc<dyn InboxVersionStore>,
    clock: RwLock<Arc<dyn Clock>>,
    gap_timeout: Duration,
    backlog: usize,
    users: Mutex<HashMap<UserId, Arc<UserSlot>>>,
    stopped: AtomicBool,
    next_generation: AtomicU64,
}

struct UserSlot {
    seeded: OnceCell<()>,
    // One permit per accepted activity until its delivery is handed out.
    backlog: Arc<Semaphore>,
    queue: Mutex<UserQueue>,
}

#[derive(Default)]
struct UserQueue {
    expected: InboxVersion,
    waiters: BTreeMap<InboxVersion, PendingWaiter>,
    timer: Option<ArmedTimer>,
    outbound: VecDeque<Outbound>,
    draining: bool,
}

struct PendingWaiter {
    queued_at: Instant,
    deliver: DeliverFn,
    permit: OwnedSemaphorePermit,
}

struct ArmedTimer {
    generation: u64,
    handle: TimerHandle,
}

struct Outbound {
    version: InboxVersion,
    mode: DeliveryMode,
    deliver: DeliverFn,
    permit: OwnedSemaphorePermit,
}

impl UserQueue {
    fn push(
        &mut self,
        version: InboxVersion,
        mode: DeliveryMode,
        deliver: DeliverFn,
        permit: OwnedSemaphorePermit,
    ) {
        self.outbound.push_back(Outbound {
            version,
            mode,
            deliver,
            permit,
        });
    }

    /// Returns how many waiters were released.
    fn cascade(&mut self) -> usize {
        let mut released = 0;
        loop {
            let next = self.expected.next();
            let Some(waiter) = self.waiters.remove(&next) else {
                return released;
            };
            self.expected = next;
            self.push(next, DeliveryMode::InOrder, waiter.deliver, waiter.permit);
            released += 1;
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.cancel();
        }
    }

    fn claim_drain(&mut self) -> bool {
        if self.draining || self.outbound.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }
}

impl InboxVersionOrderer {
    pub fn new(
        store: Arc<dyn InboxVersionStore>,
        clock: Arc<dyn Clock>,
        gap_timeout: Duration,
    ) -> Self {
        Self::with_backlog(store, clock, gap_timeout, DEFAULT_BACKLOG)
    }

    /// `backlog` caps how many activities per user may be buffered or queued
    /// for delivery. Further submits for that user wait for room.
    pub fn with_backlog(
        store: Arc<dyn InboxVersionStore>,
        clock: Arc<dyn Clock>,
        gap_timeout: Duration,
        backlog: usize,
    ) -> Self {
        Self {
            inner: Arc::new(OrdererInner {
                store,
                clock: RwLock::new(clock),
                gap_timeout,
                backlog: backlog.clamp(1, Semaphore::MAX_PERMITS),
                users: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn gap_timeout(&self) -> Duration {
        self.inner.gap_timeout
    }

    /// Timers that are already armed stay on the previous clock.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self
            .inner
            .clock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = clock;
    }

    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Cancels every gap timer and drops buffered waiters. Submits are
    /// refused until [`start`](Self::start); deliveries already handed out
    /// run to completion.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let slots: Vec<Arc<UserSlot>> = lock_unpoisoned(&self.inner.users)
            .values()
            .cloned()
            .collect();
        for slot in slots {
            let mut queue = lock_unpoisoned(&slot.queue);
            queue.cancel_timer();
            queue.waiters.clear();
        }
        debug!("orderer: stopped");
    }

    pub fn waiting(&self, uid: UserId) -> usize {
        self.inner
            .existing_slot(uid)
            .map(|slot| lock_unpoisoned(&slot.queue).waiters.len())
            .unwrap_or(0)
    }

    pub fn expected(&self, uid: UserId) -> Option<InboxVersion> {
        let slot = self.inner.existing_slot(uid)?;
        let expected = lock_unpoisoned(&slot.queue).expected;
        (!expected.is_unknown()).then_some(expected)
    }

    /// Schedules `deliver` for `target`. It runs at most once, after every
    /// lower version for this user has been delivered or skipped. Stale and
    /// duplicate versions are dropped without calling `deliver`.
    ///
    /// A zero `target` carries no ordering information and is delivered
    /// immediately without touching the user's state.
    pub async fn submit(&self, uid: UserId, target: InboxVersion, deliver: DeliverFn) {
        if self.inner.stopped.load(Ordering::Acquire) {
            debug!(uid = uid.0, version = target.0, "orderer: stopped, dropping submit");
            return;
        }
        let slot = self.inner.slot(uid);
        slot.seeded
            .get_or_init(|| self.inner.seed(uid, &slot))
            .await;

        let Ok(permit) = Arc::clone(&slot.backlog).acquire_owned().await else {
            return;
        };
        if self.inner.stopped.load(Ordering::Acquire) {
            debug!(uid = uid.0, version = target.0, "orderer: stopped, dropping submit");
            return;
        }

        let drain = {
            let mut queue = lock_unpoisoned(&slot.queue);
            self.inner.accept(uid, &mut queue, target, deliver, permit);
            queue.claim_drain()
        };
        if drain {
            run_drain(uid, slot).await;
        }
    }
}

impl OrdererInner {
    fn existing_slot(&self, uid: UserId) -> Option<Arc<UserSlot>> {
        lock_unpoisoned(&self.users).get(&uid).cloned()
    }

    fn slot(&self, uid: UserId) -> Arc<UserSlot> {
        let mut users = lock_unpoisoned(&self.users);
        let slot = users.entry(uid).or_insert_with(|| {
            Arc::new(UserSlot {
                seeded: OnceCell::new(),
                backlog: Arc::new(Semaphore::new(self.backlog)),
                queue: Mutex::new(UserQueue::default()),
            })
        });
        Arc::clone(slot)
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(
            &self
                .clock
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    async fn seed(&self, uid: UserId, slot: &UserSlot) {
        let stored = match self.store.inbox_version(uid).await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(err) => {
                warn!(uid = uid.0, error = %err, "orderer: failed to load inbox version, treating as unknown");
                InboxVersion::UNKNOWN
            }
        };
        let mut queue = lock_unpoisoned(&slot.queue);
        if stored > queue.expected {
            queue.expected = stored;
        }
        debug!(uid = uid.0, version = stored.0, "orderer: seeded inbox version");
    }

    fn accept(
        self: &Arc<Self>,
        uid: UserId,
        queue: &mut UserQueue,
        target: InboxVersion,
        deliver: DeliverFn,
        permit: OwnedSemaphorePermit,
    ) {
        if target.is_unknown() {
            queue.push(target, DeliveryMode::InOrder, deliver, permit);
            return;
        }

        if queue.expected.is_unknown() {
            debug!(uid = uid.0, version = target.0, "orderer: adopting first observed version as baseline");
            queue.expected = target;
            queue.push(target, DeliveryMode::InOrder, deliver, permit);
            return;
        }

        if target <= queue.expected {
            debug!(
                uid = uid.0,
                version = target.0,
                expected = queue.expected.0,
                "orderer: dropping stale inbox version"
            );
            return;
        }

        if target == queue.expected.next() {
            queue.expected = target;
            queue.push(target, DeliveryMode::InOrder, deliver, permit);
            let released = queue.cascade();
            if queue.waiters.is_empty() {
                queue.cancel_timer();
            } else if released > 0 {
                // A new oldest waiter starts its own wait.
                self.arm(uid, queue);
            }
            return;
        }

        if queue.waiters.contains_key(&target) {
            debug!(uid = uid.0, version = target.0, "orderer: dropping duplicate buffered version");
            return;
        }
        debug!(
            uid = uid.0,
            version = target.0,
            expected = queue.expected.0,
            "orderer: gap detected, buffering"
        );
        queue.waiters.insert(
            target,
            PendingWaiter {
                queued_at: self.clock().now(),
                deliver,
                permit,
            },
        );
        if queue.timer.is_none() {
            self.arm(uid, queue);
        }
    }

    fn arm(self: &Arc<Self>, uid: UserId, queue: &mut UserQueue) {
        queue.cancel_timer();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner: Weak<OrdererInner> = Arc::downgrade(self);
        let handle = self.clock().after(
            self.gap_timeout,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(inner) = inner.upgrade() {
                        inner.gap_timer_fired(uid, generation).await;
                    }
                })
            }),
        );
        queue.timer = Some(ArmedTimer { generation, handle });
    }

    async fn gap_timer_fired(self: Arc<Self>, uid: UserId, generation: u64) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(slot) = self.existing_slot(uid) else {
            return;
        };
        let drain = {
            let mut queue = lock_unpoisoned(&slot.queue);
            let current = queue.timer.as_ref().map(|timer| timer.generation);
            if current != Some(generation) {
                return;
            }
            queue.timer = None;
            self.force_oldest(uid, &mut queue);
            queue.claim_drain()
        };
        if drain {
            run_drain(uid, slot).await;
        }
    }

    fn force_oldest(self: &Arc<Self>, uid: UserId, queue: &mut UserQueue) {
        let Some((version, waiter)) = queue.waiters.pop_first() else {
            return;
        };
        let waited = self.clock().now().saturating_duration_since(waiter.queued_at);
        warn!(
            uid = uid.0,
            version = version.0,
            expected = queue.expected.0,
            waited_ms = waited.as_millis() as u64,
            "orderer: gap not filled in time, forcing delivery"
        );
        queue.expected = version;
        queue.push(version, DeliveryMode::Forced, waiter.deliver, waiter.permit);
        queue.cascade();
        if !queue.waiters.is_empty() {
            self.arm(uid, queue);
        }
    }
}

/// Releases the drain role if the draining task unwinds before the queue
/// is empty, so the next submit or gap timer can take over.
struct DrainGuard {
    slot: Arc<UserSlot>,
    released: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.released {
            lock_unpoisoned(&self.slot.queue).draining = false;
        }
    }
}

/// Runs the queued deliveries on a task of their own, so a caller that stops
/// waiting never strands them. Only the caller that won
/// [`UserQueue::claim_drain`] gets here. Deliveries for a user never overlap
/// and a `deliver` may call `submit` again.
async fn run_drain(uid: UserId, slot: Arc<UserSlot>) {
    loop {
        let guard = DrainGuard {
            slot: Arc::clone(&slot),
            released: false,
        };
        match tokio::spawn(drain_outbound(uid, guard)).await {
            Ok(()) => return,
            Err(err) => {
                warn!(uid = uid.0, error = %err, "orderer: delivery task failed, resuming drain");
            }
        }
        if !lock_unpoisoned(&slot.queue).claim_drain() {
            return;
        }
    }
}

async fn drain_outbound(uid: UserId, mut guard: DrainGuard) {
    loop {
        let next = {
            let mut queue = lock_unpoisoned(&guard.slot.queue);
            match queue.outbound.pop_front() {
                Some(next) => next,
                None => {
                    queue.draining = false;
                    drop(queue);
                    guard.released = true;
                    return;
                }
            }
        };
        let Outbound {
            version,
            mode,
            deliver,
            permit,
        } = next;
        drop(permit);
        debug!(uid = uid.0, version = version.0, mode = ?mode, "orderer: delivering");
        deliver(mode).await;
    }
}

#[cfg(test)]
#[path = "tests/orderer_tests.rs"]
mod tests;
