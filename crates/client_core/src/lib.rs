use std::sync::{Mutex, MutexGuard};

pub mod clock;
pub mod config;
pub mod error;
pub mod funnel;
pub mod inbox_version;
pub mod notifier;
pub mod orderer;
pub mod push;
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock, TimerCallback, TimerHandle};
pub use config::{load_settings, load_settings_from, prepare_database_url, PushSettings};
pub use error::{ClockError, PushError};
pub use funnel::{ActivityNotifyFunnel, ActivityTask};
pub use inbox_version::{InboxVersionStore, MemoryInboxVersionStore};
pub use notifier::{ChannelChatNotifier, ChatNotifier, NotifierEvent, NullChatNotifier};
pub use orderer::{DeliverFn, DeliveryMode, InboxVersionOrderer};
pub use push::{can_skip_incoming, Dispatch, PushHandler};
pub use typing::{TypingPresenceMonitor, TypingUpdateSink};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
