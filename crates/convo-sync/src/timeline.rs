//! Message timeline of the open conversation.
//!
//! Invariants held by every mutation:
//! - no two messages share an identifier (primary or provider id)
//! - timestamps are non-decreasing from front to back

use std::time::Duration;

use tracing::{debug, trace};

use convo_core::events::{EventPayload, NotificationEvent};
use convo_core::ids::ConversationId;
use convo_core::model::{Message, MessageStatus};
use convo_settings::StatusPolicy;

/// Same-direction messages closer together than this render as one group.
pub const GROUPING_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimelineChange {
    Appended,
    StatusPatched,
    Unchanged,
}

/// Read-only copy published to the UI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
pub struct MessageTimelineReconciler {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    policy: StatusPolicy,
    grouping_window: Duration,
}

impl Default for MessageTimelineReconciler {
    fn default() -> Self {
        Self::new(StatusPolicy::default())
    }
}

impl MessageTimelineReconciler {
    pub fn new(policy: StatusPolicy) -> Self {
        Self {
            conversation_id: None,
            messages: Vec::new(),
            policy,
            grouping_window: GROUPING_WINDOW,
        }
    }

    pub fn with_grouping_window(mut self, window: Duration) -> Self {
        self.grouping_window = window;
        self
    }

    /// Switch to `conversation_id`. Returns false if it was already open.
    pub fn open(&mut self, conversation_id: ConversationId) -> bool {
        if self.conversation_id.as_ref() == Some(&conversation_id) {
            return false;
        }
        debug!(conversation_id = %conversation_id, "timeline opened");
        self.conversation_id = Some(conversation_id);
        self.messages.clear();
        true
    }

    pub fn close(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Merge a fetched page. A page for a conversation that is no longer
    /// open is stale and ignored; returns whether it was applied.
    pub fn load(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) -> bool {
        if self.conversation_id.as_ref() != Some(conversation_id) {
            debug!(conversation_id = %conversation_id, "ignoring stale message page");
            return false;
        }
        let fetched = messages.len();
        let mut inserted = 0usize;
        for message in messages {
            if self.insert(message) {
                inserted += 1;
            }
        }
        debug!(conversation_id = %conversation_id, fetched, inserted, "message page merged");
        true
    }

    pub fn on_event(&mut self, event: &NotificationEvent) -> TimelineChange {
        match &event.payload {
            EventPayload::NewMessage {
                message: Some(message),
                ..
            }
            | EventPayload::NewConversation {
                message: Some(message),
                ..
            } => {
                if self.insert(message.clone()) {
                    TimelineChange::Appended
                } else {
                    TimelineChange::Unchanged
                }
            }
            EventPayload::MessageStatus {
                conversation_id,
                message_id,
                status,
            } => {
                let elsewhere = conversation_id
                    .as_ref()
                    .is_some_and(|id| self.conversation_id.as_ref() != Some(id));
                if elsewhere {
                    return TimelineChange::Unchanged;
                }
                if self.patch_status(message_id, *status) {
                    TimelineChange::StatusPatched
                } else {
                    TimelineChange::Unchanged
                }
            }
            EventPayload::NewMessage { message: None, .. }
            | EventPayload::NewConversation { message: None, .. }
            | EventPayload::Typing { .. } => TimelineChange::Unchanged,
        }
    }

    /// Insert unless any of the message's identifiers is already present.
    /// Messages for other conversations are ignored.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.conversation_id.as_ref() != Some(&message.conversation_id) {
            return false;
        }
        if let Some(existing) = self.messages.iter_mut().find(|m| m.shares_identifier(&message)) {
            if existing.external_id.is_none() && message.external_id.is_some() {
                existing.external_id = message.external_id;
            }
            trace!(message_id = %message.id, "message already in timeline");
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(at, message);
        true
    }

    /// Patch the status of the message known by `target`. Unknown targets
    /// are a no-op.
    pub fn patch_status(&mut self, target: &str, status: MessageStatus) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| m.has_identifier(target)) else {
            trace!(message_id = target, "status update for unknown message");
            return false;
        };
        let applies = match self.policy {
            StatusPolicy::LastWriteWins => message.status != status,
            StatusPolicy::Monotonic => message.status.advances_to(status),
        };
        if applies {
            debug!(
                message_id = %message.id,
                from = message.status.as_str(),
                to = status.as_str(),
                "message status patched"
            );
            message.status = status;
        }
        applies
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the message at `index` continues the group of the one before.
    pub fn is_grouped(&self, index: usize) -> bool {
        match self.messages.get(index) {
            Some(curr) => is_consecutive_within(
                index.checked_sub(1).and_then(|i| self.messages.get(i)),
                curr,
                self.grouping_window,
            ),
            None => false,
        }
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            conversation_id: self.conversation_id.clone(),
            messages: self.messages.clone(),
        }
    }
}

/// Grouping predicate with the default five minute window.
pub fn is_consecutive(prev: Option<&Message>, curr: &Message) -> bool {
    is_consecutive_within(prev, curr, GROUPING_WINDOW)
}

pub fn is_consecutive_within(prev: Option<&Message>, curr: &Message, window: Duration) -> bool {
    let Some(prev) = prev else {
        return false;
    };
    if prev.direction != curr.direction {
        return false;
    }
    let gap = curr.timestamp.signed_duration_since(prev.timestamp);
    match chrono::Duration::from_std(window) {
        Ok(window) => gap < window,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convo_core::events::Decoded;
    use convo_core::ids::MessageId;
    use convo_core::model::{MessageDirection, MessageType};

    fn msg(id: &str, secs: i64, direction: MessageDirection) -> Message {
        Message {
            id: MessageId::from_raw(id),
            external_id: None,
            conversation_id: ConversationId::from_raw("c1"),
            direction,
            kind: MessageType::Text,
            content: format!("body {id}"),
            status: MessageStatus::Sent,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn inbound(id: &str, secs: i64) -> Message {
        msg(id, secs, MessageDirection::Inbound)
    }

    fn event(raw: &str) -> NotificationEvent {
        match NotificationEvent::decode(raw, Utc::now()).unwrap() {
            Decoded::Event(e) => e,
            Decoded::Unknown(k) => panic!("unknown {k}"),
        }
    }

    fn opened() -> MessageTimelineReconciler {
        let mut t = MessageTimelineReconciler::default();
        t.open(ConversationId::from_raw("c1"));
        t
    }

    fn ids(t: &MessageTimelineReconciler) -> Vec<&str> {
        t.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn identical_event_twice_yields_one_entry() {
        let mut t = opened();
        let raw = r#"{"type":"new_message","conversationId":"c1",
                      "message":{"id":"m1","content":"hi"},"timestamp":100}"#;
        assert_eq!(t.on_event(&event(raw)), TimelineChange::Appended);
        assert_eq!(t.on_event(&event(raw)), TimelineChange::Unchanged);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn inserts_keep_timestamp_order() {
        let mut t = opened();
        t.insert(inbound("a", 30));
        t.insert(inbound("b", 10));
        t.insert(inbound("c", 20));
        t.insert(inbound("d", 20));
        assert_eq!(ids(&t), vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn provider_id_counts_as_identity() {
        let mut t = opened();
        let mut sent = inbound("m1", 10);
        sent.external_id = Some("wamid.1".into());
        t.insert(sent);

        assert!(!t.insert(inbound("wamid.1", 11)));
        assert_eq!(t.len(), 1);
        assert!(t.patch_status("wamid.1", MessageStatus::Read));
        assert_eq!(t.messages()[0].status, MessageStatus::Read);
    }

    #[test]
    fn status_for_unknown_message_is_noop() {
        let mut t = opened();
        let e = event(r#"{"type":"message_status","messageId":"m-unknown","status":"read"}"#);
        assert_eq!(t.on_event(&e), TimelineChange::Unchanged);
        assert!(t.is_empty());
    }

    #[test]
    fn status_for_other_conversation_is_ignored() {
        let mut t = opened();
        t.insert(inbound("m1", 1));
        let e = event(
            r#"{"type":"message_status","conversationId":"c2","messageId":"m1","status":"read"}"#,
        );
        assert_eq!(t.on_event(&e), TimelineChange::Unchanged);
        assert_eq!(t.messages()[0].status, MessageStatus::Sent);
    }

    #[test]
    fn last_write_wins_allows_regression() {
        let mut t = opened();
        t.insert(inbound("m1", 1));
        assert!(t.patch_status("m1", MessageStatus::Read));
        assert!(t.patch_status("m1", MessageStatus::Delivered));
        assert_eq!(t.messages()[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn monotonic_policy_never_regresses() {
        let mut t = MessageTimelineReconciler::new(StatusPolicy::Monotonic);
        t.open(ConversationId::from_raw("c1"));
        t.insert(inbound("m1", 1));
        assert!(t.patch_status("m1", MessageStatus::Read));
        assert!(!t.patch_status("m1", MessageStatus::Delivered));
        assert!(t.patch_status("m1", MessageStatus::Failed));
        assert_eq!(t.messages()[0].status, MessageStatus::Failed);
    }

    #[test]
    fn events_for_other_conversations_do_not_insert() {
        let mut t = opened();
        let raw = r#"{"type":"new_message","conversationId":"c2",
                      "message":{"id":"m1"},"timestamp":1}"#;
        assert_eq!(t.on_event(&event(raw)), TimelineChange::Unchanged);
        assert!(t.is_empty());
    }

    #[test]
    fn bodyless_new_message_leaves_timeline_alone() {
        let mut t = opened();
        let raw = r#"{"type":"new_message","id":"m1","conversationId":"c1","timestamp":100}"#;
        assert_eq!(t.on_event(&event(raw)), TimelineChange::Unchanged);
        assert!(t.is_empty());
    }

    #[test]
    fn stale_load_is_ignored() {
        let mut t = opened();
        assert!(!t.load(&ConversationId::from_raw("c2"), vec![inbound("x", 1)]));
        assert!(t.is_empty());

        assert!(t.load(&ConversationId::from_raw("c1"), vec![inbound("m2", 2), inbound("m1", 1)]));
        assert!(t.load(&ConversationId::from_raw("c1"), vec![inbound("m1", 1), inbound("m3", 3)]));
        assert_eq!(ids(&t), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn reopening_same_conversation_keeps_messages() {
        let mut t = opened();
        t.insert(inbound("m1", 1));
        assert!(!t.open(ConversationId::from_raw("c1")));
        assert_eq!(t.len(), 1);
        assert!(t.open(ConversationId::from_raw("c2")));
        assert!(t.is_empty());
    }

    #[test]
    fn grouping_predicate() {
        let first = inbound("a", 0);
        assert!(!is_consecutive(None, &first));
        assert!(is_consecutive(Some(&first), &inbound("b", 100)));
        assert!(!is_consecutive(Some(&first), &inbound("c", 400)));
        assert!(!is_consecutive(
            Some(&first),
            &msg("d", 100, MessageDirection::Outbound)
        ));

        let mut t = opened();
        t.insert(first);
        t.insert(inbound("b", 100));
        assert!(!t.is_grouped(0));
        assert!(t.is_grouped(1));
        assert!(!t.is_grouped(2));
    }
}
