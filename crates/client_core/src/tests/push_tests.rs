use super::*;
use crate::{
    clock::ManualClock,
    inbox_version::FailingInboxVersionStore,
    notifier::{ChannelChatNotifier, NotifierEvent},
};
use shared::{
    domain::{InboxVersion, MessageId, TopicType},
    protocol::{ConversationMember, ConversationSummary, MessageSummary},
};
use std::time::Duration;
use storage::Storage;
use tokio::sync::{broadcast, oneshot};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CONV: ConversationId = ConversationId(10);

struct Harness {
    handler: PushHandler,
    events: broadcast::Receiver<NotifierEvent>,
    clock: ManualClock,
    storage: Arc<Storage>,
}

async fn harness() -> Harness {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.expect("storage"));
    harness_with(storage, ManualClock::new())
}

fn harness_with(storage: Arc<Storage>, clock: ManualClock) -> Harness {
    let notifier = ChannelChatNotifier::default();
    let events = notifier.subscribe();
    let handler = PushHandler::new(
        &PushSettings::default(),
        storage.clone(),
        Arc::new(notifier),
        Arc::new(clock.clone()),
    );
    handler.start();
    Harness {
        handler,
        events,
        clock,
        storage,
    }
}

/// Waits until every notification queued so far has been emitted, then
/// returns them.
async fn drain_events(
    handler: &PushHandler,
    events: &mut broadcast::Receiver<NotifierEvent>,
) -> Vec<NotifierEvent> {
    let (tx, rx) = oneshot::channel();
    handler
        .funnel()
        .enqueue(Box::pin(async move {
            let _ = tx.send(());
        }))
        .await;
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("funnel drained")
        .expect("flush task ran");

    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

impl Harness {
    async fn drain(&mut self) -> Vec<NotifierEvent> {
        drain_events(&self.handler, &mut self.events).await
    }

    async fn send(&self, msg: &OutOfBandMessage) -> Dispatch {
        self.handler.dispatch(msg).await.expect("dispatch")
    }
}

fn read_message(version: u64) -> ActivityAction {
    ActivityAction::ReadMessage {
        msg_id: MessageId(version as i64),
    }
}

fn activity_msg(uid: UserId, version: u64, action: ActivityAction) -> OutOfBandMessage {
    OutOfBandMessage::encode(
        uid,
        CHAT_ACTIVITY_SYSTEM,
        &ActivityPayload {
            conv_id: CONV,
            topic_type: TopicType::Chat,
            inbox_vers: InboxVersion(version),
            action,
        },
    )
    .expect("encode activity")
}

fn typing_msg(uid: UserId, typing: bool) -> OutOfBandMessage {
    OutOfBandMessage::encode(
        uid,
        CHAT_TYPING_SYSTEM,
        &TypingPayload {
            uid,
            conv_id: CONV,
            typing,
        },
    )
    .expect("encode typing")
}

fn activity_event(uid: UserId, action: ActivityAction) -> NotifierEvent {
    NotifierEvent::Activity {
        uid,
        topic_type: TopicType::Chat,
        conv_id: CONV,
        action,
    }
}

fn background_message(conv_id: ConversationId) -> ActivityAction {
    ActivityAction::NewMessage {
        message: MessageSummary {
            message_id: MessageId(200),
            sender_id: BOB,
            ciphertext_b64: "aGk=".into(),
            outbox_id: None,
            sent_at: Default::default(),
        },
        conv: Some(ConversationSummary {
            conv_id,
            team_type: TeamType::Complex,
            read_msg_id: MessageId(10),
            max_visible_msg_id: MessageId(200),
        }),
        display_desktop_notification: false,
    }
}

#[tokio::test]
async fn activities_reach_the_ui_in_version_order() {
    let mut h = harness().await;

    for version in [1, 3, 2] {
        h.send(&activity_msg(ALICE, version, read_message(version)))
            .await;
    }
    assert_eq!(
        h.drain().await,
        vec![
            activity_event(ALICE, read_message(1)),
            activity_event(ALICE, read_message(2)),
            activity_event(ALICE, read_message(3)),
        ]
    );

    h.send(&activity_msg(ALICE, 5, read_message(5))).await;
    h.clock.advance(Duration::from_secs(1)).await;
    assert!(h.drain().await.is_empty());

    h.clock.advance(Duration::from_secs(1)).await;
    assert_eq!(
        h.drain().await,
        vec![
            NotifierEvent::InboxStale { uid: ALICE },
            activity_event(ALICE, read_message(5)),
        ]
    );
    assert_eq!(
        h.storage
            .load_inbox_version(ALICE)
            .await
            .expect("load version"),
        Some(InboxVersion(5))
    );

    h.handler.stop().await;
}

#[tokio::test]
async fn delivered_versions_are_persisted_and_seed_the_next_handler() {
    let mut h = harness().await;
    h.send(&activity_msg(ALICE, 7, read_message(7))).await;
    h.send(&activity_msg(ALICE, 8, read_message(8))).await;
    assert_eq!(h.drain().await.len(), 2);
    h.handler.stop().await;

    let mut restarted = harness_with(h.storage.clone(), h.clock.clone());
    restarted
        .send(&activity_msg(ALICE, 8, read_message(8)))
        .await;
    restarted
        .send(&activity_msg(ALICE, 9, read_message(9)))
        .await;
    assert_eq!(
        restarted.drain().await,
        vec![activity_event(ALICE, read_message(9))]
    );
    restarted.handler.stop().await;
}

#[tokio::test]
async fn unversioned_activity_bypasses_ordering() {
    let mut h = harness().await;
    h.send(&activity_msg(ALICE, 4, read_message(4))).await;
    h.send(&activity_msg(ALICE, 0, read_message(0))).await;

    assert_eq!(
        h.drain().await,
        vec![
            activity_event(ALICE, read_message(4)),
            activity_event(ALICE, read_message(0)),
        ]
    );
    assert_eq!(h.handler.orderer().expected(ALICE), Some(InboxVersion(4)));
    h.handler.stop().await;
}

#[tokio::test]
async fn typing_updates_flow_through_the_handler() {
    let mut h = harness().await;
    h.handler
        .typing_monitor()
        .set_timeout(Duration::from_secs(60));

    h.send(&typing_msg(BOB, true)).await;
    h.send(&typing_msg(BOB, false)).await;
    h.send(&typing_msg(BOB, true)).await;
    h.clock.advance(Duration::from_secs(3600)).await;

    let snapshot = |typers: Vec<UserId>| {
        NotifierEvent::Typing {
            updates: vec![ConvTypingUpdate {
                conv_id: CONV,
                typers,
            }],
        }
    };
    assert_eq!(
        h.drain().await,
        vec![
            snapshot(vec![BOB]),
            snapshot(Vec::new()),
            snapshot(vec![BOB]),
            snapshot(Vec::new()),
        ]
    );
    h.handler.stop().await;
}

#[tokio::test]
async fn unknown_chat_system_is_an_error() {
    let h = harness().await;
    let msg = OutOfBandMessage::new(ALICE, "chat.bogus", b"{}".to_vec());

    let err = h.handler.dispatch(&msg).await.expect_err("unknown system");
    assert!(matches!(err, PushError::UnknownChatSystem(system) if system == "chat.bogus"));
    h.handler.stop().await;
}

#[tokio::test]
async fn other_namespaces_are_ignored() {
    let mut h = harness().await;
    let msg = OutOfBandMessage::new(ALICE, "kbfs.favorites", b"{}".to_vec());

    assert_eq!(h.send(&msg).await, Dispatch::Ignored);
    assert!(h.drain().await.is_empty());
    h.handler.stop().await;
}

#[tokio::test]
async fn malformed_bodies_are_dropped() {
    let mut h = harness().await;

    let activity = OutOfBandMessage::new(ALICE, CHAT_ACTIVITY_SYSTEM, b"not json".to_vec());
    let typing = OutOfBandMessage::new(ALICE, CHAT_TYPING_SYSTEM, b"{\"typing\":1}".to_vec());
    assert_eq!(h.send(&activity).await, Dispatch::Handled);
    assert_eq!(h.send(&typing).await, Dispatch::Handled);

    assert!(h.drain().await.is_empty());
    assert_eq!(h.handler.orderer().expected(ALICE), None);
    assert_eq!(h.handler.typing_monitor().typer_count().await, 0);
    h.handler.stop().await;
}

#[tokio::test]
async fn background_messages_skip_the_ui_but_still_advance_the_version() {
    let mut h = harness().await;

    h.send(&activity_msg(ALICE, 1, background_message(CONV)))
        .await;
    assert!(h.drain().await.is_empty());
    assert_eq!(
        h.storage
            .load_inbox_version(ALICE)
            .await
            .expect("load version"),
        Some(InboxVersion(1))
    );

    h.handler.set_selected_conversation(Some(CONV));
    h.send(&activity_msg(ALICE, 2, background_message(CONV)))
        .await;
    assert_eq!(
        h.drain().await,
        vec![activity_event(ALICE, background_message(CONV))]
    );
    h.handler.stop().await;
}

#[tokio::test]
async fn members_update_announces_joins_and_leaves() {
    let mut h = harness().await;
    let action = ActivityAction::MembersUpdate {
        joined: vec![ConversationMember {
            conv_id: CONV,
            uid: BOB,
            topic_type: TopicType::Chat,
        }],
        removed: vec![ConversationMember {
            conv_id: CONV,
            uid: UserId(3),
            topic_type: TopicType::Chat,
        }],
    };

    h.send(&activity_msg(ALICE, 1, action.clone())).await;
    assert_eq!(
        h.drain().await,
        vec![
            NotifierEvent::JoinedConversation {
                uid: BOB,
                conv_id: CONV,
                topic_type: TopicType::Chat,
            },
            NotifierEvent::LeftConversation {
                uid: UserId(3),
                conv_id: CONV,
                topic_type: TopicType::Chat,
            },
            activity_event(ALICE, action),
        ]
    );
    h.handler.stop().await;
}

#[tokio::test]
async fn stopped_handler_drops_new_activity() {
    let mut h = harness().await;
    h.handler.stop().await;

    h.send(&activity_msg(ALICE, 1, read_message(1))).await;
    h.handler.start();
    assert!(h.drain().await.is_empty());
    h.handler.stop().await;
}

#[tokio::test]
async fn store_failures_do_not_block_notifications() {
    let notifier = ChannelChatNotifier::default();
    let mut events = notifier.subscribe();
    let handler = PushHandler::new(
        &PushSettings::default(),
        Arc::new(FailingInboxVersionStore),
        Arc::new(notifier),
        Arc::new(ManualClock::new()),
    );
    handler.start();

    for version in [3, 4] {
        handler
            .dispatch(&activity_msg(ALICE, version, read_message(version)))
            .await
            .expect("dispatch");
    }
    assert_eq!(
        drain_events(&handler, &mut events).await,
        vec![
            activity_event(ALICE, read_message(3)),
            activity_event(ALICE, read_message(4)),
        ]
    );
    assert_eq!(handler.orderer().expected(ALICE), Some(InboxVersion(4)));
    handler.stop().await;
}

#[test]
fn skip_policy_requires_every_condition() {
    let skippable = background_message(CONV);
    assert!(can_skip_incoming(&skippable, None, 100));
    assert!(can_skip_incoming(&skippable, Some(ConversationId(99)), 100));

    assert!(!can_skip_incoming(&skippable, Some(CONV), 100));
    assert!(!can_skip_incoming(&skippable, None, 190));

    let ActivityAction::NewMessage { message, conv, .. } = skippable.clone() else {
        unreachable!("background_message builds a new message");
    };

    let notify = ActivityAction::NewMessage {
        message: message.clone(),
        conv: conv.clone(),
        display_desktop_notification: true,
    };
    assert!(!can_skip_incoming(&notify, None, 100));

    let simple_team = ActivityAction::NewMessage {
        message: message.clone(),
        conv: conv.map(|conv| ConversationSummary {
            team_type: TeamType::Simple,
            ..conv
        }),
        display_desktop_notification: false,
    };
    assert!(!can_skip_incoming(&simple_team, None, 100));

    let without_conv = ActivityAction::NewMessage {
        message,
        conv: None,
        display_desktop_notification: false,
    };
    assert!(!can_skip_incoming(&without_conv, None, 100));
    assert!(!can_skip_incoming(&read_message(1), None, 100));
}
