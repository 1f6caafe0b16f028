//! Session-level behaviour against a scripted connector and REST mock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::watch;

use convo_core::errors::TransportError;
use convo_core::frames::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use convo_core::ids::{BusinessId, ConversationId, MessageId};
use convo_core::model::{
    ContactIdentity, Conversation, ConversationStatus, Message, MessageDirection, MessageStatus,
    MessageType,
};
use convo_sync::mock::{MockConnector, MockConversationApi, MockRemote};
use convo_sync::{ConnectionState, Handshake, SessionConfig, SyncSession, TimerKind};
use convo_telemetry::MetricsRecorder;

const WAIT: Duration = Duration::from_secs(60);

struct Harness {
    session: SyncSession,
    connector: Arc<MockConnector>,
    api: Arc<MockConversationApi>,
    metrics: Arc<MetricsRecorder>,
}

fn harness_with(connector: MockConnector) -> Harness {
    let connector = Arc::new(connector);
    let api = Arc::new(MockConversationApi::new());
    let metrics = Arc::new(MetricsRecorder::new());
    let handshake = Handshake::new(
        "ws://localhost:8080/ws",
        BusinessId::from_raw("b_1"),
        SecretString::from("token"),
    );
    let session = SyncSession::new(
        SessionConfig::default(),
        handshake,
        connector.clone(),
        api.clone(),
        Arc::clone(&metrics),
    );
    Harness {
        session,
        connector,
        api,
        metrics,
    }
}

fn harness() -> Harness {
    harness_with(MockConnector::new())
}

fn cid(id: &str) -> ConversationId {
    ConversationId::from_raw(id)
}

fn conversation(id: &str, at_secs: i64, unread: u32) -> Conversation {
    Conversation {
        id: cid(id),
        contact: ContactIdentity {
            phone_number: format!("+1555000{id}"),
            display_name: None,
        },
        last_message_preview: None,
        last_message_at: Some(Utc.timestamp_opt(at_secs, 0).unwrap()),
        unread_count: unread,
        status: ConversationStatus::Active,
    }
}

fn message(id: &str, conv: &str, at_secs: i64) -> Message {
    Message {
        id: MessageId::from_raw(id),
        external_id: None,
        conversation_id: cid(conv),
        direction: MessageDirection::Inbound,
        kind: MessageType::Text,
        content: format!("body of {id}"),
        status: MessageStatus::Delivered,
        timestamp: Utc.timestamp_opt(at_secs, 0).unwrap(),
    }
}

fn new_message_frame(id: &str, conv: &str, ts_ms: i64) -> Value {
    json!({
        "type": "new_message",
        "conversationId": conv,
        "message": { "id": id, "content": format!("hello {id}"), "timestamp": ts_ms },
        "timestamp": ts_ms
    })
}

async fn wait_until<T>(rx: &mut watch::Receiver<T>, what: &str, mut pred: impl FnMut(&T) -> bool) {
    tokio::time::timeout(WAIT, rx.wait_for(|v| pred(v)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .expect("publisher dropped");
}

/// Start the session and return the remote end of the first transport.
async fn start(h: &Harness) -> MockRemote {
    assert!(h.session.init());
    let mut status = h.session.connection_status();
    wait_until(&mut status, "open connection", |s| s.is_connected()).await;
    h.connector.last_remote().expect("transport created")
}

fn timeline_ids(h: &Harness) -> Vec<String> {
    h.session
        .timeline()
        .borrow()
        .messages
        .iter()
        .map(|m| m.id.to_string())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn identical_frame_twice_yields_one_timeline_entry() {
    let h = harness();
    h.api.set_conversations(vec![conversation("c1", 100, 0)]);
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    let frame = new_message_frame("m1", "c1", 100);
    remote.push_json(frame.clone());
    remote.push_json(frame);

    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "m1 in timeline", |t| !t.messages.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(timeline_ids(&h), vec!["m1"]);
    assert_eq!(
        h.metrics
            .counter_get("sync.frames_dropped", &[("reason", "duplicate")]),
        1
    );
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn reordered_redelivery_keeps_first_copy_only() {
    let h = harness();
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    remote.push_json(new_message_frame("A", "c1", 1_000));
    remote.push_json(new_message_frame("B", "c1", 2_000));
    remote.push_json(new_message_frame("A", "c1", 1_000));

    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "A and B", |t| t.messages.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(timeline_ids(&h), vec!["A", "B"]);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn open_conversation_is_shown_read() {
    let h = harness();
    h.api
        .set_conversations(vec![conversation("c1", 200, 5), conversation("c2", 100, 2)]);
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    let mut list = h.session.conversations();
    wait_until(&mut list, "initial list", |l| l.len() == 2).await;
    {
        let list = list.borrow();
        assert_eq!(list[0].id.as_str(), "c1");
        assert_eq!(list[0].unread_count, 0);
        assert_eq!(list[1].unread_count, 2);
    }

    // New activity in c2 moves it to the top after the refetch.
    h.api.upsert_conversation(conversation("c2", 300, 3));
    h.api.upsert_conversation(conversation("c1", 200, 6));
    remote.push_json(new_message_frame("m9", "c2", 300_000));
    wait_until(&mut list, "c2 on top", |l| l[0].id.as_str() == "c2").await;
    {
        let list = list.borrow();
        assert_eq!(list[0].unread_count, 3);
        assert_eq!(list[1].id.as_str(), "c1");
        assert_eq!(list[1].unread_count, 0);
    }
    // Not for the open conversation, so the timeline is untouched.
    assert!(timeline_ids(&h).is_empty());
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn status_updates_patch_known_messages_only() {
    let h = harness();
    h.api.set_messages(cid("c1"), vec![message("m1", "c1", 10)]);
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "fetched page", |t| t.messages.len() == 1).await;

    remote.push_json(json!({"type": "message_status", "messageId": "m-unknown", "status": "read"}));
    remote.push_json(json!({"type": "message_status", "conversationId": "c1", "messageId": "m1", "status": "read"}));
    wait_until(&mut timeline, "m1 read", |t| {
        t.messages
            .first()
            .is_some_and(|m| m.status == MessageStatus::Read)
    })
    .await;
    assert_eq!(timeline_ids(&h), vec!["m1"]);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_skipped() {
    let h = harness();
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    remote.push_text("definitely not json");
    remote.push_json(json!({"type": "presence", "conversationId": "c1"}));
    remote.push_json(new_message_frame("m1", "c1", 100));

    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "m1 after garbage", |t| t.messages.len() == 1).await;
    assert_eq!(
        h.metrics
            .counter_get("sync.frames_dropped", &[("reason", "malformed")]),
        1
    );
    assert_eq!(h.session.connection_status().borrow().state, ConnectionState::Open);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_list_and_timeline() {
    let h = harness();
    h.api.set_conversations(vec![conversation("c1", 100, 0)]);
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    let mut list = h.session.conversations();
    wait_until(&mut list, "initial list", |l| l.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let list_calls = h.api.list_calls();

    // Activity the client misses while the connection is down.
    h.api
        .set_conversations(vec![conversation("c1", 100, 0), conversation("c2", 500, 1)]);
    h.api.set_messages(cid("c1"), vec![message("missed", "c1", 400)]);
    remote.close(ABNORMAL_CLOSURE);

    let mut status = h.session.connection_status();
    wait_until(&mut status, "reconnecting", |s| {
        s.state == ConnectionState::Reconnecting
    })
    .await;
    wait_until(&mut status, "reopened", |s| s.is_connected()).await;

    wait_until(&mut list, "list refetched", |l| l.len() == 2).await;
    assert!(h.api.list_calls() > list_calls);
    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "missed message", |t| {
        t.messages.iter().any(|m| m.id.as_str() == "missed")
    })
    .await;
    assert_eq!(h.connector.attempts(), 2);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn sent_message_and_its_echo_are_one_entry() {
    let h = harness();
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    let sent = h.session.send_message("hello there").await.unwrap();
    assert_eq!(sent.id.as_str(), "srv_1");
    assert_eq!(sent.direction, MessageDirection::Outbound);
    assert_eq!(h.api.sent(), vec![(cid("c1"), "hello there".to_string())]);

    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "acknowledged message", |t| t.messages.len() == 1).await;

    remote.push_json(json!({
        "type": "new_message",
        "conversationId": "c1",
        "message": {"id": "srv_1", "direction": "outbound", "content": "hello there"},
        "timestamp": sent.timestamp.timestamp_millis()
    }));
    remote.push_json(new_message_frame("m2", "c1", sent.timestamp.timestamp_millis() + 1));
    wait_until(&mut timeline, "reply", |t| {
        t.messages.iter().any(|m| m.id.as_str() == "m2")
    })
    .await;
    assert_eq!(timeline_ids(&h), vec!["srv_1", "m2"]);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn typing_sends_one_stop_after_idle() {
    let h = harness();
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    h.session.set_typing(true).unwrap();
    h.session.set_typing(true).unwrap();
    assert!(h.session.scheduler().is_pending(TimerKind::TypingStop));
    tokio::time::sleep(Duration::from_millis(3_100)).await;

    let typing: Vec<Value> = remote
        .sent_json()
        .into_iter()
        .filter(|f| f["type"] == "typing")
        .collect();
    assert_eq!(
        typing,
        vec![
            json!({"type": "typing", "conversationId": "c1", "isTyping": true}),
            json!({"type": "typing", "conversationId": "c1", "isTyping": false}),
        ]
    );
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn remote_typing_is_published() {
    let h = harness();
    let remote = start(&h).await;
    let mut typing = h.session.remote_typing();

    remote.push_json(json!({"type": "typing", "conversationId": "c7", "isTyping": true, "timestamp": 1}));
    wait_until(&mut typing, "c7 typing", |set| set.contains(&cid("c7"))).await;
    remote.push_json(json!({"type": "typing", "conversationId": "c7", "isTyping": false, "timestamp": 2}));
    wait_until(&mut typing, "c7 stopped", |set| set.is_empty()).await;
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn remote_typing_lapses_without_stop_frame() {
    let h = harness();
    let remote = start(&h).await;
    let mut typing = h.session.remote_typing();

    let began = tokio::time::Instant::now();
    remote.push_json(json!({"type": "typing", "conversationId": "c7", "isTyping": true, "timestamp": 1}));
    wait_until(&mut typing, "c7 typing", |set| set.contains(&cid("c7"))).await;
    wait_until(&mut typing, "c7 lapsed", |set| set.is_empty()).await;
    assert!(began.elapsed() >= Duration::from_secs(3));
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn bodyless_new_message_refetches_list_and_open_timeline() {
    let h = harness();
    h.api.set_conversations(vec![conversation("c1", 100, 0)]);
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;

    let mut list = h.session.conversations();
    wait_until(&mut list, "initial list", |l| l.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let list_calls = h.api.list_calls();
    let message_calls = h.api.message_calls();

    h.api
        .set_conversations(vec![conversation("c1", 200, 0), conversation("c2", 150, 1)]);
    h.api.set_messages(cid("c1"), vec![message("m9", "c1", 200)]);
    remote.push_json(json!({"type": "new_message", "id": "m9", "conversationId": "c1", "timestamp": 200_000}));

    wait_until(&mut list, "list refetched", |l| l.len() == 2).await;
    let mut timeline = h.session.timeline();
    wait_until(&mut timeline, "announced message", |t| {
        t.messages.iter().any(|m| m.id.as_str() == "m9")
    })
    .await;
    assert!(h.api.list_calls() > list_calls);
    assert!(h.api.message_calls() > message_calls);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn bodyless_new_message_elsewhere_skips_timeline_fetch() {
    let h = harness();
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let list_calls = h.api.list_calls();
    let message_calls = h.api.message_calls();

    remote.push_json(json!({"type": "new_message", "conversationId": 42, "timestamp": 5}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.api.list_calls() > list_calls);
    assert_eq!(h.api.message_calls(), message_calls);
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn filter_change_replaces_list() {
    let h = harness();
    let mut archived = conversation("c3", 50, 0);
    archived.status = ConversationStatus::Archived;
    h.api
        .set_conversations(vec![conversation("c1", 100, 0), archived]);
    start(&h).await;

    let mut list = h.session.conversations();
    wait_until(&mut list, "all conversations", |l| l.len() == 2).await;
    h.session
        .set_filter(Some(ConversationStatus::Archived))
        .unwrap();
    wait_until(&mut list, "archived only", |l| {
        l.len() == 1 && l[0].id.as_str() == "c3"
    })
    .await;
    h.session.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn dispose_closes_normally_and_leaves_no_timers() {
    let h = harness();
    h.session.open_conversation(cid("c1")).unwrap();
    let remote = start(&h).await;
    h.session.set_typing(true).unwrap();
    assert!(h.session.scheduler().pending_count() >= 2);

    h.session.dispose().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!h.session.is_running());
    assert_eq!(h.session.scheduler().pending_count(), 0);
    assert_eq!(remote.closed_with(), Some(NORMAL_CLOSURE));
    assert_eq!(
        h.session.connection_status().borrow().state,
        ConnectionState::Closed
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts(), 1);
    assert!(h.session.refresh_conversations().is_err());
}

#[tokio::test(start_paused = true)]
async fn failed_connection_recovers_only_through_reconnect() {
    let h = harness_with(MockConnector::failing(TransportError::HandshakeRejected {
        status: 503,
    }));
    assert!(h.session.init());

    let mut status = h.session.connection_status();
    wait_until(&mut status, "failed", |s| s.state == ConnectionState::Failed).await;
    assert_eq!(h.connector.attempts(), 6);
    assert!(!h.session.scheduler().is_pending(TimerKind::Reconnect));

    h.connector.set_failing(None);
    h.session.reconnect();
    wait_until(&mut status, "recovered", |s| s.is_connected()).await;
    assert_eq!(h.session.connection_status().borrow().attempt, 0);
    h.session.dispose().await;
}
