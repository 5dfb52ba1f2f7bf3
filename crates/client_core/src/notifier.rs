use async_trait::async_trait;
use shared::{
    domain::{ConversationId, TopicType, UserId},
    protocol::{ActivityAction, ConvTypingUpdate},
};
use serde::Serialize;
use tokio::sync::broadcast;

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn chat_activity(
        &self,
        uid: UserId,
        topic_type: TopicType,
        conv_id: ConversationId,
        action: ActivityAction,
    );
    async fn typing_update(&self, updates: Vec<ConvTypingUpdate>);
    async fn joined_conversation(
        &self,
        uid: UserId,
        conv_id: ConversationId,
        topic_type: TopicType,
    );
    async fn left_conversation(&self, uid: UserId, conv_id: ConversationId, topic_type: TopicType);
    /// Incremental updates were forced past a gap; the UI should resync the
    /// full inbox for this user.
    async fn inbox_stale(&self, uid: UserId);
}

pub struct NullChatNotifier;

#[async_trait]
impl ChatNotifier for NullChatNotifier {
    async fn chat_activity(
        &self,
        _uid: UserId,
        _topic_type: TopicType,
        _conv_id: ConversationId,
        _action: ActivityAction,
    ) {
    }

    async fn typing_update(&self, _updates: Vec<ConvTypingUpdate>) {}

    async fn joined_conversation(
        &self,
        _uid: UserId,
        _conv_id: ConversationId,
        _topic_type: TopicType,
    ) {
    }

    async fn left_conversation(
        &self,
        _uid: UserId,
        _conv_id: ConversationId,
        _topic_type: TopicType,
    ) {
    }

    async fn inbox_stale(&self, _uid: UserId) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifierEvent {
    Activity {
        uid: UserId,
        topic_type: TopicType,
        conv_id: ConversationId,
        action: ActivityAction,
    },
    Typing {
        updates: Vec<ConvTypingUpdate>,
    },
    JoinedConversation {
        uid: UserId,
        conv_id: ConversationId,
        topic_type: TopicType,
    },
    LeftConversation {
        uid: UserId,
        conv_id: ConversationId,
        topic_type: TopicType,
    },
    InboxStale {
        uid: UserId,
    },
}

#[derive(Clone)]
pub struct ChannelChatNotifier {
    events: broadcast::Sender<NotifierEvent>,
}

impl ChannelChatNotifier {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: NotifierEvent) {
        // No subscribers is not an error for a UI sink.
        let _ = self.events.send(event);
    }
}

impl Default for ChannelChatNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChatNotifier for ChannelChatNotifier {
    async fn chat_activity(
        &self,
        uid: UserId,
        topic_type: TopicType,
        conv_id: ConversationId,
        action: ActivityAction,
    ) {
        self.publish(NotifierEvent::Activity {
            uid,
            topic_type,
            conv_id,
            action,
        });
    }

    async fn typing_update(&self, updates: Vec<ConvTypingUpdate>) {
        self.publish(NotifierEvent::Typing { updates });
    }

    async fn joined_conversation(
        &self,
        uid: UserId,
        conv_id: ConversationId,
        topic_type: TopicType,
    ) {
        self.publish(NotifierEvent::JoinedConversation {
            uid,
            conv_id,
            topic_type,
        });
    }

    async fn left_conversation(&self, uid: UserId, conv_id: ConversationId, topic_type: TopicType) {
        self.publish(NotifierEvent::LeftConversation {
            uid,
            conv_id,
            topic_type,
        });
    }

    async fn inbox_stale(&self, uid: UserId) {
        self.publish(NotifierEvent::InboxStale { uid });
    }
}
