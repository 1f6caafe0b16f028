//! Recency-ordered conversation list kept in step with the server.
//!
//! Events never edit conversations directly. A `new_message` or
//! `new_conversation` event asks for an authoritative refetch, and the
//! refetched page is merged into the cache.

use std::cmp::Ordering;

use tracing::debug;

use convo_core::events::NotificationEvent;
use convo_core::ids::ConversationId;
use convo_core::model::{Conversation, ConversationStatus};

/// Parameters for the list call a reconciler wants made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefetchRequest {
    pub status: Option<ConversationStatus>,
    pub page: u32,
}

#[derive(Debug)]
pub struct ConversationListReconciler {
    conversations: Vec<Conversation>,
    /// Conversation open in the UI; always shown as read.
    active: Option<ConversationId>,
    filter: Option<ConversationStatus>,
    page: u32,
    /// Set by a filter change: the next refetch replaces instead of merging.
    replace_next: bool,
}

impl Default for ConversationListReconciler {
    fn default() -> Self {
        Self {
            conversations: Vec::new(),
            active: None,
            filter: None,
            page: 1,
            replace_next: false,
        }
    }
}

impl ConversationListReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refetch_request(&self) -> RefetchRequest {
        RefetchRequest {
            status: self.filter,
            page: self.page,
        }
    }

    /// Returns the refetch to perform when `event` changes the list.
    pub fn on_event(&self, event: &NotificationEvent) -> Option<RefetchRequest> {
        event
            .affects_conversation_list()
            .then(|| self.refetch_request())
    }

    /// Fold an authoritative page into the cache.
    pub fn apply_refetch(&mut self, fetched: Vec<Conversation>) {
        if std::mem::take(&mut self.replace_next) {
            self.conversations = fetched;
        } else {
            for fresh in fetched {
                match self.conversations.iter_mut().find(|c| c.id == fresh.id) {
                    Some(cached) => cached.merge_from(fresh),
                    None => self.conversations.push(fresh),
                }
            }
        }
        if let Some(status) = self.filter {
            self.conversations.retain(|c| c.status == status);
        }
        self.conversations.sort_by(by_recency);
        self.suppress_active_unread();
        debug!(
            count = self.conversations.len(),
            filter = self.filter.map(|s| s.as_str()),
            "conversation list reconciled"
        );
    }

    /// Replace the cache outright.
    pub fn replace(&mut self, conversations: Vec<Conversation>) {
        self.replace_next = true;
        self.apply_refetch(conversations);
    }

    pub fn set_active(&mut self, conversation_id: Option<ConversationId>) {
        self.active = conversation_id;
        self.suppress_active_unread();
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Change the status filter. The next refetch replaces the collection.
    pub fn set_filter(&mut self, filter: Option<ConversationStatus>) -> RefetchRequest {
        self.filter = filter;
        self.page = 1;
        self.replace_next = true;
        self.refetch_request()
    }

    pub fn filter(&self) -> Option<ConversationStatus> {
        self.filter
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    fn suppress_active_unread(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if let Some(c) = self.conversations.iter_mut().find(|c| &c.id == active) {
            c.unread_count = 0;
        }
    }
}

/// Newest activity first; conversations with no activity last; ties by id.
fn by_recency(a: &Conversation, b: &Conversation) -> Ordering {
    match (a.last_message_at, b.last_message_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}
