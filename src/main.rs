//! # convo
//!
//! Runs a sync session against a live server and logs connectivity, the
//! conversation list and the open timeline as they change.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;

use convo_core::ids::ConversationId;
use convo_core::model::ConversationStatus;
use convo_settings::{load_settings_from_path, settings_path, SyncSettings};
use convo_sync::{Handshake, HttpConversationApi, SessionConfig, SyncSession, WebSocketConnector};
use convo_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};

/// Realtime conversation sync client.
#[derive(Parser, Debug)]
#[command(name = "convo", about = "Realtime conversation sync client")]
struct Cli {
    /// Settings file (defaults to ~/.convo/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// WebSocket endpoint (overrides settings).
    #[arg(long)]
    url: Option<String>,

    /// Business the session is scoped to (overrides settings).
    #[arg(long)]
    business_id: Option<String>,

    /// REST base URL (overrides settings).
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer credential for both the socket and the REST API.
    #[arg(long, env = "CONVO_TOKEN", hide_env_values = true)]
    token: String,

    /// Conversation to open on start.
    #[arg(long)]
    open: Option<String>,

    /// Only list conversations with this status (active, closed, archived).
    #[arg(long, value_parser = parse_status)]
    status: Option<ConversationStatus>,
}

fn parse_status(s: &str) -> Result<ConversationStatus, String> {
    match s {
        "active" => Ok(ConversationStatus::Active),
        "closed" => Ok(ConversationStatus::Closed),
        "archived" => Ok(ConversationStatus::Archived),
        other => Err(format!("unknown status `{other}`")),
    }
}

impl Cli {
    fn apply_overrides(&self, settings: &mut SyncSettings) {
        if let Some(url) = &self.url {
            settings.connection.url.clone_from(url);
        }
        if let Some(id) = &self.business_id {
            settings.connection.business_id.clone_from(id);
        }
        if let Some(url) = &self.api_url {
            settings.api.base_url.clone_from(url);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    args.apply_overrides(&mut settings);

    let telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json,
    ));

    if settings.connection.business_id.is_empty() {
        anyhow::bail!("no business id: set connection.businessId, CONVO_BUSINESS_ID or --business-id");
    }

    let token = SecretString::from(args.token.clone());
    let handshake = Handshake::from_settings(&settings.connection, token.clone());
    let api = HttpConversationApi::from_settings(&settings.api, token)
        .context("invalid api settings")?;

    let session = SyncSession::new(
        SessionConfig::from_settings(&settings),
        handshake,
        Arc::new(WebSocketConnector),
        Arc::new(api),
        telemetry.metrics(),
    );

    if let Some(id) = &args.open {
        session.open_conversation(ConversationId::from_raw(id.clone()))?;
    }
    session.init();
    if args.status.is_some() {
        session.set_filter(args.status)?;
    }

    let mut status = session.connection_status();
    let mut conversations = session.conversations();
    let mut timeline = session.timeline();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for ctrl-c")?;
                break;
            }
            Ok(()) = status.changed() => {
                let s = status.borrow_and_update().clone();
                tracing::info!(
                    state = s.state.as_str(),
                    attempt = s.attempt,
                    retry_in_ms = s.retry_in.map(|d| d.as_millis() as u64),
                    last_error = s.last_error.as_deref(),
                    "connection"
                );
            }
            Ok(()) = conversations.changed() => {
                let list = Arc::clone(&conversations.borrow_and_update());
                tracing::info!(count = list.len(), "conversations updated");
                for c in list.iter().take(10) {
                    tracing::info!(
                        conversation_id = %c.id,
                        contact = c.contact.label(),
                        unread = c.unread_count,
                        status = c.status.as_str(),
                        "  conversation"
                    );
                }
            }
            Ok(()) = timeline.changed() => {
                let snapshot = Arc::clone(&timeline.borrow_and_update());
                if let Some(last) = snapshot.messages.last() {
                    tracing::info!(
                        conversation_id = snapshot.conversation_id.as_ref().map(|c| c.as_str()),
                        messages = snapshot.messages.len(),
                        last_id = %last.id,
                        last_status = last.status.as_str(),
                        "timeline updated"
                    );
                }
            }
        }
    }

    tracing::info!("shutting down");
    session.dispose().await;
    report_metrics(&telemetry.metrics());
    Ok(())
}

fn report_metrics(metrics: &MetricsRecorder) {
    let backoff = metrics.histogram_summary("sync.backoff_delay_ms", &[]);
    tracing::info!(
        opened = metrics.counter_get("sync.transport_opened", &[]),
        frames = metrics.counter_get("sync.frames_received", &[]),
        retries = backoff.count,
        backoff_p50_ms = backoff.p50,
        backoff_max_ms = backoff.max,
        "connection summary"
    );
    for sample in metrics.snapshot() {
        tracing::debug!(name = %sample.name, value = ?sample.value, labels = ?sample.labels, "metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_accepts_explicit_token() {
        let cli = Cli::try_parse_from(["convo", "--token", "s3cret", "--open", "c1"]).unwrap();
        assert_eq!(cli.token, "s3cret");
        assert_eq!(cli.open.as_deref(), Some("c1"));
        assert!(cli.settings.is_none());
        assert!(cli.status.is_none());
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "convo",
            "--token",
            "t",
            "--url",
            "wss://rt.example.com/ws",
            "--business-id",
            "b_9",
            "--status",
            "archived",
        ]);
        let mut settings = SyncSettings::default();
        cli.apply_overrides(&mut settings);
        assert_eq!(settings.connection.url, "wss://rt.example.com/ws");
        assert_eq!(settings.connection.business_id, "b_9");
        assert_eq!(settings.api.base_url, SyncSettings::default().api.base_url);
        assert_eq!(cli.status, Some(ConversationStatus::Archived));
    }

    #[test]
    fn metrics_report_tolerates_quiet_session() {
        let metrics = MetricsRecorder::new();
        report_metrics(&metrics);
        metrics.histogram_observe("sync.backoff_delay_ms", &[], 1000.0);
        report_metrics(&metrics);
        assert_eq!(metrics.histogram_summary("sync.backoff_delay_ms", &[]).count, 1);
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(parse_status("deleted").is_err());
    }
}
