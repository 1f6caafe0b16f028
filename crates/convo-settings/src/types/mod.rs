//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so partial JSON
//! files only need to name the values they change.

mod connection;
mod logging;
mod sync;

pub use connection::*;
pub use logging::*;
pub use sync::*;

use serde::{Deserialize, Serialize};

/// Root settings for a sync client.
///
/// ```json
/// {
///   "connection": { "url": "wss://chat.example.com/ws", "businessId": "b_42" },
///   "reconnect": { "maxAttempts": 8 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub connection: ConnectionSettings,
    pub reconnect: ReconnectSettings,
    pub dedup: DedupSettings,
    pub timeline: TimelineSettings,
    pub typing: TypingSettings,
    pub api: ApiSettings,
    pub logging: LoggingSettings,
}

impl SyncSettings {
    /// Correct values that cannot work together, warning about each fix.
    pub fn validate(&mut self) {
        fn at_least(val: &mut u64, min: u64, name: &str) {
            if *val < min {
                tracing::warn!("{name} ({val}) below minimum, raised to {min}");
                *val = min;
            }
        }

        let rc = &mut self.reconnect;
        at_least(&mut rc.base_delay_ms, 1, "reconnect.baseDelayMs");
        if rc.max_delay_ms < rc.base_delay_ms {
            tracing::warn!(
                "reconnect.maxDelayMs ({}) < baseDelayMs ({}), correcting",
                rc.max_delay_ms,
                rc.base_delay_ms
            );
            rc.max_delay_ms = rc.base_delay_ms;
        }

        at_least(&mut self.dedup.retention_ms, 1_000, "dedup.retentionMs");
        at_least(&mut self.dedup.prune_interval_ms, 1_000, "dedup.pruneIntervalMs");
        at_least(&mut self.typing.idle_timeout_ms, 100, "typing.idleTimeoutMs");
        at_least(
            &mut self.connection.handshake_timeout_ms,
            100,
            "connection.handshakeTimeoutMs",
        );

        if self.connection.outbound_queue == 0 {
            tracing::warn!("connection.outboundQueue is 0, raised to 1");
            self.connection.outbound_queue = 1;
        }
    }
}
