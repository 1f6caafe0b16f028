//! Ordered buffer of dispatched events with supersede-by-key.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use convo_core::events::NotificationEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// An unconsumed event with the same supersede key was replaced in place.
    Superseded,
}

/// FIFO of events waiting to be applied.
///
/// Events with a [`NotificationEvent::supersede_key`] replace a pending
/// event carrying the same key, keeping its position in the queue. All
/// other events append.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<NotificationEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: NotificationEvent) -> PushOutcome {
        if let Some(key) = event.supersede_key() {
            let pending = self
                .events
                .iter_mut()
                .find(|queued| queued.supersede_key() == Some(key));
            if let Some(slot) = pending {
                *slot = event;
                return PushOutcome::Superseded;
            }
        }
        self.events.push_back(event);
        PushOutcome::Appended
    }

    /// Remove and return every pending event, oldest first.
    pub fn drain(&mut self) -> Vec<NotificationEvent> {
        self.events.drain(..).collect()
    }

    /// Drop pending events received before `cutoff`. Returns how many went.
    pub fn retain_since(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.received_at >= cutoff);
        before - self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationEvent> {
        self.events.iter()
    }
}
