//! Seam between the connection manager and the socket implementation.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use convo_core::errors::TransportError;
use convo_core::frames::OutboundFrame;
use convo_core::ids::BusinessId;
use convo_settings::{AuthMode, ConnectionSettings};

/// What a live transport reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16, reason: String },
    Failed(TransportError),
}

/// One open, bidirectional text-frame connection.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound event. Must be cancel-safe: it is raced against
    /// outbound sends and shutdown.
    async fn next_event(&mut self) -> TransportEvent;

    async fn close(&mut self, code: u16, reason: &str);
}

/// Builds transports. Every failure, including a rejected handshake, comes
/// back as an error and is never raised past the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn Transport>, TransportError>;
}

/// Fire-and-forget outbound path for components that emit frames.
pub trait FrameSink: Send + Sync {
    /// Whether the frame was handed to an open transport. Never queued for
    /// later delivery.
    fn send_frame(&self, frame: &OutboundFrame) -> bool;
}

/// Everything needed to open a session-scoped connection.
#[derive(Debug)]
pub struct Handshake {
    pub url: String,
    pub business_id: BusinessId,
    pub token: SecretString,
    pub auth_mode: AuthMode,
    pub timeout: Duration,
}

impl Handshake {
    pub fn new(url: impl Into<String>, business_id: BusinessId, token: SecretString) -> Self {
        Self {
            url: url.into(),
            business_id,
            token,
            auth_mode: AuthMode::QueryParams,
            timeout: Duration::from_secs(10),
        }
    }

    /// Handshake for the configured endpoint. The token never comes from
    /// settings.
    pub fn from_settings(settings: &ConnectionSettings, token: SecretString) -> Self {
        Self::new(
            settings.url.clone(),
            BusinessId::from_raw(settings.business_id.clone()),
            token,
        )
        .with_auth_mode(settings.auth_mode)
        .with_timeout(Duration::from_millis(settings.handshake_timeout_ms))
    }

    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect URL. In query-parameter mode the credentials are appended.
    pub fn endpoint(&self) -> Result<Url, TransportError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }
        if self.auth_mode == AuthMode::QueryParams {
            url.query_pairs_mut()
                .append_pair("businessId", self.business_id.as_str())
                .append_pair("token", self.token.expose_secret());
        }
        Ok(url)
    }

    /// Frame to send right after the socket opens, in frame auth mode.
    pub fn auth_frame(&self) -> Option<OutboundFrame> {
        (self.auth_mode == AuthMode::Frame).then(|| OutboundFrame::Auth {
            business_id: self.business_id.clone(),
            token: self.token.expose_secret().to_owned(),
        })
    }
}
