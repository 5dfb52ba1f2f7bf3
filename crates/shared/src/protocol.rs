use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    ConversationId, ConversationStatus, InboxVersion, MessageId, TeamType, TopicType, UserId,
};

pub const CHAT_NAMESPACE: &str = "chat";
pub const CHAT_ACTIVITY_SYSTEM: &str = "chat.activity";
pub const CHAT_TYPING_SYSTEM: &str = "chat.typing";

/// Envelope delivered by the push transport, outside the main message stream.
///
/// `system` is a dotted tag such as `chat.activity`; `body` is the JSON
/// encoding of the payload that tag names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfBandMessage {
    pub uid: UserId,
    pub system: String,
    pub body: Vec<u8>,
}

impl OutOfBandMessage {
    pub fn new(uid: UserId, system: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            uid,
            system: system.into(),
            body,
        }
    }

    pub fn encode<T: Serialize>(
        uid: UserId,
        system: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(uid, system, serde_json::to_vec(payload)?))
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Leading segment of the system tag (`chat` for `chat.activity`).
    pub fn namespace(&self) -> &str {
        self.system
            .split_once('.')
            .map(|(namespace, _)| namespace)
            .unwrap_or(&self.system)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub ciphertext_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_id: Option<Uuid>,
    pub sent_at: DateTime<Utc>,
}

/// Inbox-side view of a conversation attached to an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conv_id: ConversationId,
    #[serde(default)]
    pub team_type: TeamType,
    pub read_msg_id: MessageId,
    pub max_visible_msg_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub conv_id: ConversationId,
    pub uid: UserId,
    #[serde(default)]
    pub topic_type: TopicType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ActivityAction {
    NewMessage {
        message: MessageSummary,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conv: Option<ConversationSummary>,
        #[serde(default)]
        display_desktop_notification: bool,
    },
    ReadMessage {
        msg_id: MessageId,
    },
    SetStatus {
        status: ConversationStatus,
    },
    NewConversation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conv: Option<ConversationSummary>,
    },
    TeamType {
        team_type: TeamType,
    },
    Expunge {
        upto: MessageId,
    },
    MembersUpdate {
        #[serde(default)]
        joined: Vec<ConversationMember>,
        #[serde(default)]
        removed: Vec<ConversationMember>,
    },
}

impl ActivityAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::ReadMessage { .. } => "read_message",
            Self::SetStatus { .. } => "set_status",
            Self::NewConversation { .. } => "new_conversation",
            Self::TeamType { .. } => "team_type",
            Self::Expunge { .. } => "expunge",
            Self::MembersUpdate { .. } => "members_update",
        }
    }
}

/// Body of a `chat.activity` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub conv_id: ConversationId,
    #[serde(default)]
    pub topic_type: TopicType,
    #[serde(default)]
    pub inbox_vers: InboxVersion,
    pub action: ActivityAction,
}

/// Body of a `chat.typing` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub uid: UserId,
    pub conv_id: ConversationId,
    pub typing: bool,
}

/// Replacement snapshot of everyone typing in one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvTypingUpdate {
    pub conv_id: ConversationId,
    pub typers: Vec<UserId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_leading_tag_segment() {
        let msg = OutOfBandMessage::new(UserId(1), CHAT_TYPING_SYSTEM, Vec::new());
        assert_eq!(msg.namespace(), CHAT_NAMESPACE);

        let bare = OutOfBandMessage::new(UserId(1), "gregor", Vec::new());
        assert_eq!(bare.namespace(), "gregor");
    }

    #[test]
    fn activity_payload_uses_tagged_action_shape() {
        let raw = r#"{
            "conv_id": 7,
            "inbox_vers": 12,
            "action": {"type": "read_message", "payload": {"msg_id": 40}}
        }"#;
        let payload: ActivityPayload = serde_json::from_str(raw).expect("decode");
        assert_eq!(payload.conv_id, ConversationId(7));
        assert_eq!(payload.topic_type, TopicType::Chat);
        assert_eq!(payload.inbox_vers, InboxVersion(12));
        assert_eq!(
            payload.action,
            ActivityAction::ReadMessage {
                msg_id: MessageId(40)
            }
        );
        assert_eq!(payload.action.name(), "read_message");
    }

    #[test]
    fn missing_inbox_version_decodes_as_unknown() {
        let raw = r#"{"conv_id": 1, "action": {"type": "expunge", "payload": {"upto": 3}}}"#;
        let payload: ActivityPayload = serde_json::from_str(raw).expect("decode");
        assert!(payload.inbox_vers.is_unknown());
    }
}
