//! Session lifecycle and the single event-application loop.
//!
//! One pump task owns the dispatcher and both reconcilers. Connection
//! signals, UI commands and REST results are processed one at a time, so
//! cache mutations never interleave. The UI reads `watch` snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use convo_core::api::ConversationApi;
use convo_core::errors::{ApiError, SyncError};
use convo_core::events::EventPayload;
use convo_core::ids::ConversationId;
use convo_core::model::{Conversation, ConversationStatus, Message};
use convo_settings::{StatusPolicy, SyncSettings};
use convo_telemetry::MetricsRecorder;

use crate::backoff::BackoffPolicy;
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionSignal, ConnectionStatus};
use crate::conversations::{ConversationListReconciler, RefetchRequest};
use crate::dispatcher::NotificationDispatcher;
use crate::scheduler::{TaskScheduler, TimerKind};
use crate::timeline::{MessageTimelineReconciler, TimelineChange, TimelineSnapshot};
use crate::transport::{Connector, Handshake};
use crate::typing::TypingNotifier;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    /// How long event keys are remembered for deduplication.
    pub dedup_retention: Duration,
    pub prune_interval: Duration,
    pub typing_idle_timeout: Duration,
    pub status_policy: StatusPolicy,
    pub grouping_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            connection: ConnectionConfig {
                backoff: BackoffPolicy::from(&settings.reconnect),
                outbound_queue: settings.connection.outbound_queue,
            },
            dedup_retention: Duration::from_millis(settings.dedup.retention_ms),
            prune_interval: Duration::from_millis(settings.dedup.prune_interval_ms),
            typing_idle_timeout: Duration::from_millis(settings.typing.idle_timeout_ms),
            status_policy: settings.timeline.status_policy,
            grouping_window: Duration::from_millis(settings.timeline.grouping_window_ms),
        }
    }
}

enum Command {
    OpenConversation(ConversationId),
    CloseConversation,
    SetFilter(Option<ConversationStatus>),
    Refresh,
    InsertMessage(Message),
    Prune,
    Shutdown,
}

enum Fetched {
    Conversations(Result<Vec<Conversation>, ApiError>),
    Messages(ConversationId, Result<Vec<Message>, ApiError>),
}

enum Lifecycle {
    Stopped(Box<Pump>),
    Running {
        commands: mpsc::UnboundedSender<Command>,
        handle: JoinHandle<Pump>,
    },
    /// Between `init` and `dispose` steps, or after the pump task died.
    Unavailable,
}

/// Entry point for the realtime sync layer.
///
/// `new` has no side effects. `init` starts everything, `dispose` stops
/// everything, and the pair may be repeated.
pub struct SyncSession {
    config: SessionConfig,
    api: Arc<dyn ConversationApi>,
    connection: ConnectionManager,
    scheduler: Arc<TaskScheduler>,
    typing: TypingNotifier,
    metrics: Arc<MetricsRecorder>,
    open: Mutex<Option<ConversationId>>,
    lifecycle: Mutex<Lifecycle>,
    conversations_rx: watch::Receiver<Arc<Vec<Conversation>>>,
    timeline_rx: watch::Receiver<Arc<TimelineSnapshot>>,
    typing_rx: watch::Receiver<Arc<BTreeSet<ConversationId>>>,
}

impl SyncSession {
    pub fn new(
        config: SessionConfig,
        handshake: Handshake,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ConversationApi>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let scheduler = Arc::new(TaskScheduler::new());
        let (connection, signals) = ConnectionManager::new(
            handshake,
            connector,
            config.connection.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&metrics),
        );
        let typing = TypingNotifier::new(Arc::new(connection.clone()), Arc::clone(&scheduler))
            .with_idle_timeout(config.typing_idle_timeout);

        let (conversations_tx, conversations_rx) = watch::channel(Arc::new(Vec::new()));
        let (timeline_tx, timeline_rx) = watch::channel(Arc::new(TimelineSnapshot::default()));
        let (typing_tx, typing_rx) = watch::channel(Arc::new(BTreeSet::new()));

        let pump = Pump {
            api: Arc::clone(&api),
            signals,
            dispatcher: NotificationDispatcher::with_metrics(Arc::clone(&metrics)),
            conversations: ConversationListReconciler::new(),
            timeline: MessageTimelineReconciler::new(config.status_policy)
                .with_grouping_window(config.grouping_window),
            remote_typing: BTreeMap::new(),
            typing_expiry: config.typing_idle_timeout,
            fetches: JoinSet::new(),
            list_in_flight: false,
            list_pending: false,
            retention: config.dedup_retention,
            conversations_tx,
            timeline_tx,
            typing_tx,
        };

        Self {
            config,
            api,
            connection,
            scheduler,
            typing,
            metrics,
            open: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Stopped(Box::new(pump))),
            conversations_rx,
            timeline_rx,
            typing_rx,
        }
    }

    /// Start the pump, connect, arm dedup pruning and fetch the list.
    /// Returns false if the session is already running.
    pub fn init(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let pump = match std::mem::replace(&mut *lifecycle, Lifecycle::Unavailable) {
            Lifecycle::Stopped(pump) => pump,
            other => {
                *lifecycle = other;
                debug!("init ignored, session not stopped");
                return false;
            }
        };

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn((*pump).run(commands_rx));

        let prune = commands.clone();
        self.scheduler
            .schedule_every(TimerKind::DedupPrune, self.config.prune_interval, move || {
                let _ = prune.send(Command::Prune);
            });
        let _ = commands.send(Command::Refresh);
        let _ = commands.send(match self.open.lock().clone() {
            Some(id) => Command::OpenConversation(id),
            None => Command::CloseConversation,
        });
        self.connection.connect();

        *lifecycle = Lifecycle::Running { commands, handle };
        info!("sync session started");
        true
    }

    /// Close the transport normally, cancel every timer, clear dedup state
    /// and stop the pump. The session can be started again afterwards.
    pub async fn dispose(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Unavailable) {
                Lifecycle::Running { commands, handle } => Some((commands, handle)),
                other => {
                    *lifecycle = other;
                    None
                }
            }
        };
        let Some((commands, handle)) = running else {
            debug!("dispose ignored, session not running");
            return;
        };

        self.typing.stop();
        self.connection.disconnect();
        let cancelled = self.scheduler.cancel_all();
        let _ = commands.send(Command::Shutdown);

        match handle.await {
            Ok(pump) => {
                *self.lifecycle.lock() = Lifecycle::Stopped(Box::new(pump));
                info!(cancelled_timers = cancelled, "sync session stopped");
            }
            Err(e) => error!(error = %e, "sync pump task failed, session cannot restart"),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// While stopped, the choice is remembered and applied on `init`.
    pub fn open_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        {
            let mut open = self.open.lock();
            if open.as_ref() != Some(&conversation_id) {
                self.typing.stop();
            }
            *open = Some(conversation_id.clone());
        }
        self.command_or_defer(Command::OpenConversation(conversation_id))
    }

    pub fn close_conversation(&self) -> Result<(), SyncError> {
        *self.open.lock() = None;
        self.typing.stop();
        self.command_or_defer(Command::CloseConversation)
    }

    pub fn open_conversation_id(&self) -> Option<ConversationId> {
        self.open.lock().clone()
    }

    /// Restrict the list to one status (or lift the restriction). The next
    /// fetch replaces the list.
    pub fn set_filter(&self, status: Option<ConversationStatus>) -> Result<(), SyncError> {
        self.command(Command::SetFilter(status))
    }

    pub fn refresh_conversations(&self) -> Result<(), SyncError> {
        self.command(Command::Refresh)
    }

    /// Local typing state for the open conversation.
    pub fn set_typing(&self, is_typing: bool) -> Result<(), SyncError> {
        let conversation_id = self.open_conversation_id().ok_or(SyncError::NoOpenConversation)?;
        self.typing.set_typing(&conversation_id, is_typing);
        Ok(())
    }

    /// Send through the REST collaborator, then insert the acknowledged
    /// message into the open timeline.
    pub async fn send_message(&self, content: &str) -> Result<Message, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let conversation_id = self.open_conversation_id().ok_or(SyncError::NoOpenConversation)?;
        if !self.is_running() {
            return Err(SyncError::NotRunning);
        }
        self.typing.stop();

        let ack = self.api.send_message(&conversation_id, content).await.map_err(|e| {
            warn!(conversation_id = %conversation_id, error = %e, "send failed");
            e
        })?;
        let message = ack.into_message(conversation_id, content.to_owned());
        debug!(message_id = %message.id, "message acknowledged");
        self.command(Command::InsertMessage(message.clone()))?;
        Ok(message)
    }

    /// Tear down the connection and start over with a fresh attempt count.
    pub fn reconnect(&self) {
        self.connection.reconnect();
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn conversations(&self) -> watch::Receiver<Arc<Vec<Conversation>>> {
        self.conversations_rx.clone()
    }

    pub fn timeline(&self) -> watch::Receiver<Arc<TimelineSnapshot>> {
        self.timeline_rx.clone()
    }

    /// Conversations in which the other party is currently typing.
    pub fn remote_typing(&self) -> watch::Receiver<Arc<BTreeSet<ConversationId>>> {
        self.typing_rx.clone()
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    fn command(&self, command: Command) -> Result<(), SyncError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running { commands, .. } => {
                commands.send(command).map_err(|_| SyncError::NotRunning)
            }
            _ => Err(SyncError::NotRunning),
        }
    }
}

impl SyncSession {
    fn command_or_defer(&self, command: Command) -> Result<(), SyncError> {
        match self.command(command) {
            Err(SyncError::NotRunning) => Ok(()),
            other => other,
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.connection.disconnect();
        if let Lifecycle::Running { handle, .. } = &*self.lifecycle.lock() {
            handle.abort();
        }
    }
}

struct Pump {
    api: Arc<dyn ConversationApi>,
    signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    dispatcher: NotificationDispatcher,
    conversations: ConversationListReconciler,
    timeline: MessageTimelineReconciler,
    /// Remote typists and when their indicator lapses without a stop frame.
    remote_typing: BTreeMap<ConversationId, Instant>,
    typing_expiry: Duration,
    fetches: JoinSet<Fetched>,
    list_in_flight: bool,
    /// Another list fetch was requested while one was in flight.
    list_pending: bool,
    retention: Duration,
    conversations_tx: watch::Sender<Arc<Vec<Conversation>>>,
    timeline_tx: watch::Sender<Arc<TimelineSnapshot>>,
    typing_tx: watch::Sender<Arc<BTreeSet<ConversationId>>>,
}

impl Pump {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Self {
        loop {
            let next_expiry = self.remote_typing.values().min().copied();
            let expiry = next_expiry.unwrap_or_else(Instant::now);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.on_signals(signal),
                    None => break,
                },
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => match joined {
                    Ok(fetched) => self.on_fetched(fetched),
                    Err(e) => {
                        warn!(error = %e, "fetch task failed");
                        self.list_in_flight = false;
                    }
                },
                _ = tokio::time::sleep_until(expiry), if next_expiry.is_some() => {
                    self.expire_typing();
                }
            }
        }

        self.fetches.shutdown().await;
        self.list_in_flight = false;
        self.list_pending = false;
        self.dispatcher.clear();
        if !self.remote_typing.is_empty() {
            self.remote_typing.clear();
            self.publish_typing();
        }
        self
    }

    /// Handle `first` and every signal already queued behind it. Frames are
    /// ingested as a batch before the buffer is applied, so supersede
    /// collapses bursts; control signals flush the buffer first to keep
    /// ordering.
    fn on_signals(&mut self, first: ConnectionSignal) {
        let mut next = Some(first);
        while let Some(signal) = next.take() {
            match signal {
                ConnectionSignal::Frame(text) => {
                    let outcome = self.dispatcher.ingest(&text);
                    trace!(?outcome, "frame ingested");
                }
                control => {
                    self.apply_pending();
                    self.on_control(control);
                }
            }
            next = self.signals.try_recv().ok();
        }
        self.apply_pending();
    }

    fn on_control(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Status(status) => {
                trace!(state = status.state.as_str(), attempt = status.attempt, "connection status");
            }
            ConnectionSignal::Opened => {
                // Events missed while disconnected are recovered by refetching.
                self.dispatcher.clear();
                if !self.remote_typing.is_empty() {
                    self.remote_typing.clear();
                    self.publish_typing();
                }
                self.request_list();
                if let Some(id) = self.timeline.conversation_id().cloned() {
                    self.fetch_messages(id);
                }
            }
            ConnectionSignal::Reset => self.dispatcher.clear(),
            ConnectionSignal::Frame(text) => {
                self.dispatcher.ingest(&text);
            }
        }
    }

    fn apply_pending(&mut self) {
        let events = self.dispatcher.drain();
        if events.is_empty() {
            return;
        }
        let mut refetch = false;
        let mut resync_timeline = false;
        let mut timeline_changed = false;
        let mut typing_changed = false;

        for event in &events {
            refetch |= self.conversations.on_event(event).is_some();
            timeline_changed |= self.timeline.on_event(event) != TimelineChange::Unchanged;
            match &event.payload {
                // Announced without a body: only a fetch can show it.
                EventPayload::NewMessage {
                    conversation_id,
                    message: None,
                } => {
                    resync_timeline |= self.timeline.conversation_id() == Some(conversation_id);
                }
                EventPayload::Typing {
                    conversation_id,
                    is_typing: true,
                } => {
                    let lapses_at = Instant::now() + self.typing_expiry;
                    typing_changed |= self
                        .remote_typing
                        .insert(conversation_id.clone(), lapses_at)
                        .is_none();
                }
                EventPayload::Typing {
                    conversation_id,
                    is_typing: false,
                } => {
                    typing_changed |= self.remote_typing.remove(conversation_id).is_some();
                }
                _ => {}
            }
        }
        debug!(
            events = events.len(),
            refetch, resync_timeline, timeline_changed, typing_changed, "applied events"
        );

        if refetch {
            self.request_list();
        }
        if resync_timeline {
            if let Some(id) = self.timeline.conversation_id().cloned() {
                self.fetch_messages(id);
            }
        }
        if timeline_changed {
            self.publish_timeline();
        }
        if typing_changed {
            self.publish_typing();
        }
    }

    fn expire_typing(&mut self) {
        let now = Instant::now();
        let before = self.remote_typing.len();
        self.remote_typing.retain(|_, lapses_at| *lapses_at > now);
        let expired = before - self.remote_typing.len();
        if expired > 0 {
            debug!(expired, "remote typing lapsed without a stop frame");
            self.publish_typing();
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenConversation(id) => {
                if self.timeline.open(id.clone()) {
                    self.conversations.set_active(Some(id.clone()));
                    self.publish_timeline();
                    self.publish_conversations();
                    self.fetch_messages(id);
                }
            }
            Command::CloseConversation => {
                self.timeline.close();
                self.conversations.set_active(None);
                self.publish_timeline();
            }
            Command::SetFilter(status) => {
                let _ = self.conversations.set_filter(status);
                self.request_list();
            }
            Command::Refresh => self.request_list(),
            Command::InsertMessage(message) => {
                if self.timeline.insert(message) {
                    self.publish_timeline();
                }
                self.request_list();
            }
            Command::Prune => {
                let pruned = self.dispatcher.prune(self.retention);
                trace!(pruned, "dedup prune tick");
            }
            Command::Shutdown => {}
        }
    }

    fn on_fetched(&mut self, fetched: Fetched) {
        match fetched {
            Fetched::Conversations(result) => {
                self.list_in_flight = false;
                match result {
                    Ok(conversations) => {
                        self.conversations.apply_refetch(conversations);
                        self.publish_conversations();
                    }
                    Err(e) => warn!(kind = e.error_kind(), error = %e, "conversation refetch failed"),
                }
                if std::mem::take(&mut self.list_pending) {
                    self.request_list();
                }
            }
            Fetched::Messages(id, Ok(messages)) => {
                if self.timeline.load(&id, messages) {
                    self.publish_timeline();
                }
            }
            Fetched::Messages(id, Err(e)) => {
                warn!(conversation_id = %id, kind = e.error_kind(), error = %e, "message fetch failed");
            }
        }
    }

    /// At most one list fetch in flight; requests made meanwhile collapse
    /// into a single follow-up.
    fn request_list(&mut self) {
        if self.list_in_flight {
            self.list_pending = true;
            return;
        }
        self.list_in_flight = true;
        let RefetchRequest { status, page } = self.conversations.refetch_request();
        let api = Arc::clone(&self.api);
        self.fetches.spawn(async move {
            Fetched::Conversations(api.list_conversations(status, page).await)
        });
    }

    fn fetch_messages(&mut self, id: ConversationId) {
        let api = Arc::clone(&self.api);
        self.fetches.spawn(async move {
            let result = api.get_conversation_messages(&id).await;
            Fetched::Messages(id, result)
        });
    }

    fn publish_conversations(&self) {
        self.conversations_tx
            .send_replace(Arc::new(self.conversations.conversations().to_vec()));
    }

    fn publish_timeline(&self) {
        self.timeline_tx.send_replace(Arc::new(self.timeline.snapshot()));
    }

    fn publish_typing(&self) {
        let typists: BTreeSet<ConversationId> = self.remote_typing.keys().cloned().collect();
        self.typing_tx.send_replace(Arc::new(typists));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockConversationApi};
    use convo_core::ids::BusinessId;
    use secrecy::SecretString;

    fn session(api: Arc<MockConversationApi>) -> (SyncSession, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let handshake = Handshake::new(
            "ws://localhost/ws",
            BusinessId::from_raw("b_1"),
            SecretString::from("token"),
        );
        let session = SyncSession::new(
            SessionConfig::default(),
            handshake,
            connector.clone(),
            api,
            Arc::new(MetricsRecorder::new()),
        );
        (session, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn init_is_idempotent() {
        let (session, connector) = session(Arc::new(MockConversationApi::new()));
        assert!(session.init());
        assert!(!session.init());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(session.scheduler().is_pending(TimerKind::DedupPrune));
        session.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commands_require_running_session() {
        let (session, _connector) = session(Arc::new(MockConversationApi::new()));
        assert!(matches!(session.refresh_conversations(), Err(SyncError::NotRunning)));
        assert!(matches!(
            session.send_message("hi").await,
            Err(SyncError::NoOpenConversation)
        ));
        assert!(matches!(session.send_message("  ").await, Err(SyncError::EmptyMessage)));
        assert!(matches!(session.set_typing(true), Err(SyncError::NoOpenConversation)));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_then_init_again() {
        let api = Arc::new(MockConversationApi::new());
        let (session, connector) = session(api);
        session.init();
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.dispose().await;
        assert!(!session.is_running());
        assert_eq!(session.scheduler().pending_count(), 0);

        assert!(session.init());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.attempts(), 2);
        assert!(session.connection_status().borrow().is_connected());
        session.dispose().await;
    }

    #[test]
    fn config_follows_settings() {
        let mut settings = SyncSettings::default();
        settings.reconnect.max_attempts = 9;
        settings.timeline.status_policy = StatusPolicy::Monotonic;
        let config = SessionConfig::from_settings(&settings);
        assert_eq!(config.connection.backoff.max_attempts, 9);
        assert_eq!(config.status_policy, StatusPolicy::Monotonic);
        assert_eq!(config.dedup_retention, Duration::from_secs(300));
        assert_eq!(config.typing_idle_timeout, Duration::from_secs(3));
    }
}
