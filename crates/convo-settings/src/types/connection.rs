//! Connection and reconnect settings.

use serde::{Deserialize, Serialize};

/// Where handshake credentials travel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// `businessId` and `token` as query parameters on the connect URL.
    #[default]
    QueryParams,
    /// An `auth` frame sent immediately after the socket opens.
    Frame,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Business the session is scoped to.
    pub business_id: String,
    pub auth_mode: AuthMode,
    /// Upper bound on socket construction plus handshake.
    pub handshake_timeout_ms: u64,
    /// Frames that may wait for the socket writer before `send` reports false.
    pub outbound_queue: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            business_id: String::new(),
            auth_mode: AuthMode::QueryParams,
            handshake_timeout_ms: 10_000,
            outbound_queue: 64,
        }
    }
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Abnormal closes tolerated before the connection is declared failed.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// REST collaborator endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout_ms: 15_000,
        }
    }
}
