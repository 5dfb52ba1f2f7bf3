use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, TeamType, UserId},
    protocol::{
        ActivityAction, ActivityPayload, ConvTypingUpdate, OutOfBandMessage, TypingPayload,
        CHAT_ACTIVITY_SYSTEM, CHAT_NAMESPACE, CHAT_TYPING_SYSTEM,
    },
};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::PushSettings,
    error::PushError,
    funnel::ActivityNotifyFunnel,
    inbox_version::InboxVersionStore,
    notifier::ChatNotifier,
    orderer::{DeliverFn, DeliveryMode, InboxVersionOrderer},
    typing::{TypingPresenceMonitor, TypingUpdateSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// Not a chat envelope; some other subsystem owns it.
    Ignored,
}

#[derive(Clone)]
pub struct PushHandler {
    inner: Arc<PushInner>,
}

struct PushInner {
    orderer: InboxVersionOrderer,
    typing_monitor: TypingPresenceMonitor,
    funnel: Arc<ActivityNotifyFunnel>,
    notifier: Arc<dyn ChatNotifier>,
    store: Arc<dyn InboxVersionStore>,
    selected_conversation: RwLock<Option<ConversationId>>,
    skip_read_slack: i64,
}

struct FunnelTypingSink {
    funnel: Arc<ActivityNotifyFunnel>,
    notifier: Arc<dyn ChatNotifier>,
}

#[async_trait]
impl TypingUpdateSink for FunnelTypingSink {
    async fn typing_update(&self, updates: Vec<ConvTypingUpdate>) {
        let notifier = Arc::clone(&self.notifier);
        self.funnel
            .enqueue(Box::pin(async move {
                notifier.typing_update(updates).await;
            }))
            .await;
    }
}

impl PushHandler {
    pub fn new(
        settings: &PushSettings,
        store: Arc<dyn InboxVersionStore>,
        notifier: Arc<dyn ChatNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let funnel = Arc::new(ActivityNotifyFunnel::new(settings.funnel_capacity));
        let orderer = InboxVersionOrderer::with_backlog(
            Arc::clone(&store),
            Arc::clone(&clock),
            settings.gap_timeout(),
            settings.funnel_capacity,
        );
        let typing_monitor = TypingPresenceMonitor::new(
            Arc::new(FunnelTypingSink {
                funnel: Arc::clone(&funnel),
                notifier: Arc::clone(&notifier),
            }),
            clock,
            settings.typing_timeout(),
        );

        Self {
            inner: Arc::new(PushInner {
                orderer,
                typing_monitor,
                funnel,
                notifier,
                store,
                selected_conversation: RwLock::new(None),
                skip_read_slack: settings.skip_read_slack,
            }),
        }
    }

    pub fn orderer(&self) -> &InboxVersionOrderer {
        &self.inner.orderer
    }

    pub fn typing_monitor(&self) -> &TypingPresenceMonitor {
        &self.inner.typing_monitor
    }

    pub fn funnel(&self) -> &ActivityNotifyFunnel {
        &self.inner.funnel
    }

    /// Must run inside a tokio runtime.
    pub fn start(&self) {
        self.inner.orderer.start();
        self.inner.typing_monitor.start();
        self.inner.funnel.start();
        info!("push: handler started");
    }

    pub async fn stop(&self) {
        self.inner.orderer.stop();
        self.inner.typing_monitor.stop().await;
        self.inner.funnel.stop().await;
        info!("push: handler stopped");
    }

    /// Timers already armed keep running on the clock they were armed with.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        self.inner.orderer.set_clock(Arc::clone(&clock));
        self.inner.typing_monitor.set_clock(clock);
    }

    pub fn set_selected_conversation(&self, conv_id: Option<ConversationId>) {
        *self
            .inner
            .selected_conversation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = conv_id;
    }

    pub fn selected_conversation(&self) -> Option<ConversationId> {
        self.inner.selected_conversation()
    }

    pub async fn dispatch(&self, msg: &OutOfBandMessage) -> Result<Dispatch, PushError> {
        if msg.namespace() != CHAT_NAMESPACE {
            debug!(uid = msg.uid.0, system = %msg.system, "push: ignoring non-chat envelope");
            return Ok(Dispatch::Ignored);
        }
        match msg.system.as_str() {
            CHAT_ACTIVITY_SYSTEM => self.activity(msg).await,
            CHAT_TYPING_SYSTEM => self.typing(msg).await,
            other => return Err(PushError::UnknownChatSystem(other.to_string())),
        }
        Ok(Dispatch::Handled)
    }

    pub async fn activity(&self, msg: &OutOfBandMessage) {
        let Some(payload) = decode::<ActivityPayload>(msg) else {
            return;
        };
        let uid = msg.uid;
        let version = payload.inbox_vers;
        debug!(
            uid = uid.0,
            conv_id = payload.conv_id.0,
            version = version.0,
            action = payload.action.name(),
            "push: activity received"
        );

        let deliver = self.deliver_activity(uid, payload);
        if version.is_unknown() {
            deliver(DeliveryMode::InOrder).await;
            return;
        }
        self.inner.orderer.submit(uid, version, deliver).await;
    }

    pub async fn typing(&self, msg: &OutOfBandMessage) {
        let Some(payload) = decode::<TypingPayload>(msg) else {
            return;
        };
        debug!(
            uid = payload.uid.0,
            conv_id = payload.conv_id.0,
            typing = payload.typing,
            "push: typing received"
        );
        self.inner
            .typing_monitor
            .typing(payload.conv_id, payload.uid, payload.typing)
            .await;
    }

    fn deliver_activity(&self, uid: UserId, payload: ActivityPayload) -> DeliverFn {
        let inner = Arc::clone(&self.inner);
        Box::new(move |mode| {
            Box::pin(async move {
                let funnel = Arc::clone(&inner.funnel);
                funnel
                    .enqueue(Box::pin(async move {
                        inner.apply_activity(uid, payload, mode).await;
                    }))
                    .await;
            })
        })
    }
}

impl PushInner {
    fn selected_conversation(&self) -> Option<ConversationId> {
        *self
            .selected_conversation
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn apply_activity(&self, uid: UserId, payload: ActivityPayload, mode: DeliveryMode) {
        let ActivityPayload {
            conv_id,
            topic_type,
            inbox_vers,
            action,
        } = payload;

        if !inbox_vers.is_unknown() {
            if let Err(err) = self.store.set_inbox_version(uid, inbox_vers).await {
                warn!(uid = uid.0, version = inbox_vers.0, error = %err, "push: failed to persist inbox version");
            }
        }

        if mode == DeliveryMode::Forced {
            info!(uid = uid.0, version = inbox_vers.0, "push: delivered past a gap, inbox is stale");
            self.notifier.inbox_stale(uid).await;
        }

        if can_skip_incoming(&action, self.selected_conversation(), self.skip_read_slack) {
            debug!(uid = uid.0, conv_id = conv_id.0, "push: skipping UI notification for background conversation");
            return;
        }

        if let ActivityAction::MembersUpdate { joined, removed } = &action {
            for member in joined {
                self.notifier
                    .joined_conversation(member.uid, member.conv_id, member.topic_type)
                    .await;
            }
            for member in removed {
                self.notifier
                    .left_conversation(member.uid, member.conv_id, member.topic_type)
                    .await;
            }
        }

        self.notifier
            .chat_activity(uid, topic_type, conv_id, action)
            .await;
    }
}

/// An incoming message may skip its UI notification when it asked for no
/// desktop notification and lands in an unselected complex-team
/// conversation whose unread backlog already exceeds `slack`.
pub fn can_skip_incoming(
    action: &ActivityAction,
    selected: Option<ConversationId>,
    slack: i64,
) -> bool {
    let ActivityAction::NewMessage {
        conv: Some(conv),
        display_desktop_notification: false,
        ..
    } = action
    else {
        return false;
    };

    conv.team_type == TeamType::Complex
        && selected != Some(conv.conv_id)
        && conv.read_msg_id.0.saturating_add(slack) < conv.max_visible_msg_id.0
}

fn decode<T: DeserializeOwned>(msg: &OutOfBandMessage) -> Option<T> {
    match msg.decode_body::<T>() {
        Ok(payload) => Some(payload),
        Err(source) => {
            let err = PushError::Decode {
                system: msg.system.clone(),
                source,
            };
            warn!(uid = msg.uid.0, error = %err, "push: dropping malformed envelope");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
