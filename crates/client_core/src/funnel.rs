use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::lock_unpoisoned;

pub type ActivityTask = BoxFuture<'static, ()>;

pub const DEFAULT_FUNNEL_CAPACITY: usize = 5000;

pub struct ActivityNotifyFunnel {
    capacity: usize,
    state: Mutex<FunnelState>,
}

struct FunnelState {
    sender: Option<mpsc::Sender<ActivityTask>>,
    receiver: Option<mpsc::Receiver<ActivityTask>>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ActivityNotifyFunnel {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            capacity,
            state: Mutex::new(FunnelState {
                sender: Some(sender),
                receiver: Some(receiver),
                shutdown: None,
                worker: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.state).worker.is_some()
    }

    /// Spawns the consumer. Must run inside a tokio runtime. Tasks enqueued
    /// before the first start are kept and run once the consumer is up.
    pub fn start(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if state.worker.is_some() {
            debug!("funnel: start ignored, consumer already running");
            return;
        }
        let receiver = match state.receiver.take() {
            Some(receiver) => receiver,
            None => {
                let (sender, receiver) = mpsc::channel(self.capacity);
                state.sender = Some(sender);
                receiver
            }
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        state.shutdown = Some(shutdown_tx);
        state.worker = Some(tokio::spawn(notify_loop(receiver, shutdown_rx)));
        debug!(capacity = self.capacity, "funnel: consumer started");
    }

    /// Appends a task, waiting while the queue is full. After [`stop`] the
    /// task is dropped.
    ///
    /// [`stop`]: ActivityNotifyFunnel::stop
    pub async fn enqueue(&self, task: ActivityTask) {
        let sender = lock_unpoisoned(&self.state).sender.clone();
        let Some(sender) = sender else {
            debug!("funnel: stopped, dropping task");
            return;
        };
        if sender.send(task).await.is_err() {
            debug!("funnel: consumer gone, dropping task");
        }
    }

    /// Stops the consumer once its in-flight task finishes. Queued tasks
    /// that have not started are discarded.
    pub async fn stop(&self) {
        let (shutdown, worker) = {
            let mut state = lock_unpoisoned(&self.state);
            state.sender = None;
            state.receiver = None;
            (state.shutdown.take(), state.worker.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "funnel: consumer task ended abnormally");
            }
        }
    }
}

impl Default for ActivityNotifyFunnel {
    fn default() -> Self {
        Self::new(DEFAULT_FUNNEL_CAPACITY)
    }
}

async fn notify_loop(
    mut tasks: mpsc::Receiver<ActivityTask>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            task = tasks.recv() => match task {
                Some(task) => task.await,
                None => break,
            },
        }
    }
    debug!("funnel: consumer exited");
}

#[cfg(test)]
#[path = "tests/funnel_tests.rs"]
mod tests;
