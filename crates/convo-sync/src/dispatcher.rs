//! Inbound frame intake: parse, key, deduplicate, buffer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use convo_core::events::{Decoded, EventKind, NotificationEvent};
use convo_core::ids::EventKey;
use convo_telemetry::MetricsRecorder;

use crate::queue::{EventQueue, PushOutcome};

/// What happened to one ingested frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued(EventKind),
    /// Replaced a buffered status update for the same message.
    Superseded,
    Duplicate,
    /// Valid frame of a type this client does not handle.
    Ignored(String),
    Malformed,
}

/// Owns the recent-key set and the buffer of events not yet applied.
///
/// The recent-key set outlives draining: a frame re-delivered after its
/// first copy was applied is still a duplicate, until `prune` ages the key
/// out or `clear` drops everything.
#[derive(Default)]
pub struct NotificationDispatcher {
    recent: HashMap<EventKey, DateTime<Utc>>,
    queue: EventQueue,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    pub fn ingest(&mut self, raw: &str) -> IngestOutcome {
        self.ingest_at(raw, Utc::now())
    }

    pub fn ingest_at(&mut self, raw: &str, received_at: DateTime<Utc>) -> IngestOutcome {
        let event = match NotificationEvent::decode(raw, received_at) {
            Ok(Decoded::Event(event)) => event,
            Ok(Decoded::Unknown(kind)) => {
                debug!(frame_type = %kind, "ignoring unknown frame type");
                self.dropped("unknown_type");
                return IngestOutcome::Ignored(kind);
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                self.dropped("malformed");
                return IngestOutcome::Malformed;
            }
        };

        if self.recent.contains_key(&event.id) {
            debug!(event_id = %event.id, "dropping duplicate event");
            self.dropped("duplicate");
            return IngestOutcome::Duplicate;
        }
        let _ = self.recent.insert(event.id.clone(), received_at);

        let kind = event.kind();
        trace!(event_id = %event.id, kind = kind.as_str(), "event accepted");
        match self.queue.push(event) {
            PushOutcome::Appended => IngestOutcome::Queued(kind),
            PushOutcome::Superseded => {
                if let Some(metrics) = &self.metrics {
                    metrics.counter_inc("sync.events_superseded", &[], 1);
                }
                IngestOutcome::Superseded
            }
        }
    }

    /// Remove and return every buffered event in arrival order.
    pub fn drain(&mut self) -> Vec<NotificationEvent> {
        self.queue.drain()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    /// Forget keys and buffered events older than `max_age`.
    pub fn prune(&mut self, max_age: Duration) -> usize {
        self.prune_at(max_age, Utc::now())
    }

    pub fn prune_at(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.recent.len();
        self.recent.retain(|_, seen| *seen >= cutoff);
        let pruned = before - self.recent.len();
        let expired = self.queue.retain_since(cutoff);
        if pruned + expired > 0 {
            debug!(pruned, expired, "pruned dedup state");
        }
        self.record_size();
        pruned + expired
    }

    /// Drop all dedup state and buffered events.
    pub fn clear(&mut self) {
        if !self.recent.is_empty() || !self.queue.is_empty() {
            debug!(
                recent = self.recent.len(),
                pending = self.queue.len(),
                "clearing dedup state"
            );
        }
        self.recent.clear();
        self.queue.clear();
        self.record_size();
    }

    fn record_size(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set("sync.dedup_entries", &[], self.recent.len() as f64);
        }
    }

    fn dropped(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("sync.frames_dropped", &[("reason", reason)], 1);
        }
    }
}
