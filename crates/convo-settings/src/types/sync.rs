//! Settings for deduplication, the message timeline and typing indicators.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupSettings {
    /// How long a seen event key is remembered.
    pub retention_ms: u64,
    pub prune_interval_ms: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            retention_ms: 5 * 60 * 1_000,
            prune_interval_ms: 60 * 1_000,
        }
    }
}

/// How a status update is applied to a message that already has one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPolicy {
    /// The most recently received status is shown.
    #[default]
    LastWriteWins,
    /// Status only moves forward along sending → sent → delivered → read.
    Monotonic,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimelineSettings {
    /// Same-direction messages closer than this render as one group.
    pub grouping_window_ms: u64,
    pub status_policy: StatusPolicy,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            grouping_window_ms: 5 * 60 * 1_000,
            status_policy: StatusPolicy::LastWriteWins,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingSettings {
    /// Quiet period after the last keystroke before `isTyping: false` is sent.
    pub idle_timeout_ms: u64,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 3_000,
        }
    }
}
