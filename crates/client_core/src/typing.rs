use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    protocol::ConvTypingUpdate,
};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::{
    clock::{Clock, TimerHandle},
    lock_unpoisoned,
};

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait TypingUpdateSink: Send + Sync {
    async fn typing_update(&self, updates: Vec<ConvTypingUpdate>);
}

#[derive(Clone)]
pub struct TypingPresenceMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    sink: Arc<dyn TypingUpdateSink>,
    clock: RwLock<Arc<dyn Clock>>,
    timeout: RwLock<Duration>,
    extend_signal: RwLock<Option<mpsc::UnboundedSender<(ConversationId, UserId)>>>,
    typers: Mutex<HashMap<ConversationId, Vec<TyperEntry>>>,
    // Last snapshot sequence published per conversation. The per-conversation
    // lock is held while the sink runs; the typer map is not.
    published: std::sync::Mutex<HashMap<ConversationId, Arc<Mutex<u64>>>>,
    next_snapshot: AtomicU64,
    next_check: AtomicU64,
    stopped: AtomicBool,
}

struct TyperEntry {
    uid: UserId,
    expires_at: Instant,
    check: Option<TimerHandle>,
    check_id: u64,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

impl TypingPresenceMonitor {
    pub fn new(sink: Arc<dyn TypingUpdateSink>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                sink,
                clock: RwLock::new(clock),
                timeout: RwLock::new(timeout),
                extend_signal: RwLock::new(None),
                typers: Mutex::new(HashMap::new()),
                published: std::sync::Mutex::new(HashMap::new()),
                next_snapshot: AtomicU64::new(0),
                next_check: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        read(&self.inner.timeout)
    }

    /// Applies to expiry checks armed after this call.
    pub fn set_timeout(&self, timeout: Duration) {
        write(&self.inner.timeout, timeout);
    }

    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        write(&self.inner.clock, clock);
    }

    /// Receives `(conv_id, uid)` each time a typer's expiry is pushed out.
    pub fn set_extend_signal(&self, signal: mpsc::UnboundedSender<(ConversationId, UserId)>) {
        write(&self.inner.extend_signal, Some(signal));
    }

    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Cancels every expiry check and forgets all typers without publishing.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let mut typers = self.inner.typers.lock().await;
        for entry in typers.drain().flat_map(|(_, entries)| entries) {
            if let Some(check) = entry.check {
                check.cancel();
            }
        }
        debug!("typing: stopped");
    }

    pub async fn typers(&self, conv_id: ConversationId) -> Vec<UserId> {
        self.inner
            .typers
            .lock()
            .await
            .get(&conv_id)
            .map(|entries| entries.iter().map(|entry| entry.uid).collect())
            .unwrap_or_default()
    }

    pub async fn typer_count(&self) -> usize {
        self.inner.typers.lock().await.values().map(Vec::len).sum()
    }

    pub async fn typing(&self, conv_id: ConversationId, uid: UserId, typing: bool) {
        if self.inner.stopped.load(Ordering::Acquire) {
            debug!(conv_id = conv_id.0, uid = uid.0, "typing: stopped, ignoring update");
            return;
        }
        let mut typers = self.inner.typers.lock().await;
        let entries = typers.entry(conv_id).or_default();
        let existing = entries.iter().position(|entry| entry.uid == uid);

        match (existing, typing) {
            (Some(index), true) => {
                let ttl = read(&self.inner.timeout);
                entries[index].expires_at = self.inner.now() + ttl;
                debug!(conv_id = conv_id.0, uid = uid.0, "typing: extended");
                if let Some(signal) = read(&self.inner.extend_signal) {
                    let _ = signal.send((conv_id, uid));
                }
                return;
            }
            (None, true) => {
                let ttl = read(&self.inner.timeout);
                let check_id = self.inner.next_check.fetch_add(1, Ordering::Relaxed);
                let check = self.inner.arm_check(conv_id, uid, check_id, ttl);
                entries.push(TyperEntry {
                    uid,
                    expires_at: self.inner.now() + ttl,
                    check: Some(check),
                    check_id,
                });
                debug!(conv_id = conv_id.0, uid = uid.0, "typing: started");
            }
            (Some(index), false) => {
                let entry = entries.remove(index);
                if let Some(check) = entry.check {
                    check.cancel();
                }
                debug!(conv_id = conv_id.0, uid = uid.0, "typing: stopped typing");
            }
            (None, false) => {
                if entries.is_empty() {
                    typers.remove(&conv_id);
                }
                return;
            }
        }

        let (update, seq) = self.inner.snapshot(&mut typers, conv_id);
        drop(typers);
        self.inner.publish(update, seq).await;
    }
}

impl MonitorInner {
    fn now(&self) -> Instant {
        read(&self.clock).now()
    }

    fn arm_check(
        self: &Arc<Self>,
        conv_id: ConversationId,
        uid: UserId,
        check_id: u64,
        delay: Duration,
    ) -> TimerHandle {
        let inner: Weak<MonitorInner> = Arc::downgrade(self);
        read(&self.clock).after(
            delay,
            Box::new(move || {
                Box::pin(async move {
                    if let Some(inner) = inner.upgrade() {
                        inner.check_expiry(conv_id, uid, check_id).await;
                    }
                })
            }),
        )
    }

    async fn check_expiry(self: Arc<Self>, conv_id: ConversationId, uid: UserId, check_id: u64) {
        let mut typers = self.typers.lock().await;
        let Some(entries) = typers.get_mut(&conv_id) else {
            return;
        };
        let Some(index) = entries
            .iter()
            .position(|entry| entry.uid == uid && entry.check_id == check_id)
        else {
            return;
        };

        let now = self.now();
        let expires_at = entries[index].expires_at;
        if now < expires_at {
            let check_id = self.next_check.fetch_add(1, Ordering::Relaxed);
            let check = self.arm_check(conv_id, uid, check_id, expires_at - now);
            let entry = &mut entries[index];
            entry.check = Some(check);
            entry.check_id = check_id;
            return;
        }

        entries.remove(index);
        debug!(conv_id = conv_id.0, uid = uid.0, "typing: expired");
        let (update, seq) = self.snapshot(&mut typers, conv_id);
        drop(typers);
        self.publish(update, seq).await;
    }

    /// Current typers of `conv_id`, numbered in state order. Drops the
    /// conversation once nobody is left.
    fn snapshot(
        &self,
        typers: &mut HashMap<ConversationId, Vec<TyperEntry>>,
        conv_id: ConversationId,
    ) -> (ConvTypingUpdate, u64) {
        let current: Vec<UserId> = typers
            .get(&conv_id)
            .map(|entries| entries.iter().map(|entry| entry.uid).collect())
            .unwrap_or_default();
        if current.is_empty() {
            typers.remove(&conv_id);
        }
        let seq = self.next_snapshot.fetch_add(1, Ordering::Relaxed) + 1;
        let update = ConvTypingUpdate {
            conv_id,
            typers: current,
        };
        (update, seq)
    }

    /// Snapshots replace each other, so one that lost the race to a newer
    /// snapshot of the same conversation is dropped.
    async fn publish(&self, update: ConvTypingUpdate, seq: u64) {
        let gate = Arc::clone(
            lock_unpoisoned(&self.published)
                .entry(update.conv_id)
                .or_default(),
        );
        let mut last = gate.lock().await;
        if seq <= *last || self.stopped.load(Ordering::Acquire) {
            debug!(conv_id = update.conv_id.0, seq, "typing: dropping superseded snapshot");
            return;
        }
        *last = seq;
        self.sink.typing_update(vec![update]).await;
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
