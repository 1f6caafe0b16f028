//! Connection lifecycle and the reconnect state machine.
//!
//! The manager owns at most one live transport. Each connect attempt runs in
//! its own I/O task tagged with a generation number; anything that task
//! reports after it has been superseded is dropped. Abnormal closes,
//! handshake rejections and construction errors all take the same path:
//! capped exponential backoff until the attempt limit, then `Failed`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convo_core::errors::TransportError;
use convo_core::frames::{OutboundFrame, NORMAL_CLOSURE};
use convo_core::ids::ConnectionId;
use convo_telemetry::MetricsRecorder;

use crate::backoff::BackoffPolicy;
use crate::scheduler::{TaskScheduler, TimerKind};
use crate::transport::{Connector, FrameSink, Handshake, TransportEvent};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Closed normally. Stays closed until `connect()` or `reconnect()`.
    Closed,
    /// Attempt limit exhausted. Only `reconnect()` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Connectivity as published to observers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Abnormal closes since the last successful open.
    pub attempt: u32,
    /// Delay of the pending retry while `Reconnecting`.
    pub retry_in: Option<Duration>,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Ordered notifications for the event loop that consumes this connection.
/// `Opened` always precedes the first `Frame` of a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionSignal {
    Status(ConnectionStatus),
    /// A transport opened. Dedup state from earlier transports is stale.
    Opened,
    Frame(String),
    /// Explicit reconnect requested. Dedup state must be cleared.
    Reset,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub backoff: BackoffPolicy,
    /// Frames waiting for the socket writer before `send` reports false.
    pub outbound_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            outbound_queue: 64,
        }
    }
}

enum Closure {
    Code { code: u16, reason: String },
    Error(TransportError),
}

impl Closure {
    fn describe(&self) -> String {
        match self {
            Self::Code { code, reason } if reason.is_empty() => format!("closed with code {code}"),
            Self::Code { code, reason } => format!("closed with code {code}: {reason}"),
            Self::Error(e) => e.to_string(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Code { .. } => "abnormal_close",
            Self::Error(e) => e.error_kind(),
        }
    }
}

#[derive(Default)]
struct ConnState {
    state: ConnectionState,
    attempt: u32,
    retry_in: Option<Duration>,
    last_error: Option<String>,
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    live: Option<CancellationToken>,
}

impl ConnState {
    fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            retry_in: self.retry_in,
            last_error: self.last_error.clone(),
        }
    }

    /// Stop the live transport, if any, and invalidate its callbacks.
    fn teardown(&mut self) {
        if let Some(token) = self.live.take() {
            token.cancel();
        }
        self.outbound = None;
        self.generation += 1;
    }
}

struct Shared {
    handshake: Handshake,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    scheduler: Arc<TaskScheduler>,
    metrics: Arc<MetricsRecorder>,
    state: Mutex<ConnState>,
    status_tx: watch::Sender<ConnectionStatus>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Returns the manager and the receiving end of its signal stream.
    /// Nothing connects until [`ConnectionManager::connect`].
    pub fn new(
        handshake: Handshake,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        scheduler: Arc<TaskScheduler>,
        metrics: Arc<MetricsRecorder>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let shared = Arc::new(Shared {
            handshake,
            connector,
            config,
            scheduler,
            metrics,
            state: Mutex::new(ConnState::default()),
            status_tx,
            signal_tx,
        });
        (Self { shared }, signal_rx)
    }

    /// Start connecting. No-op while a transport is pending or open, while a
    /// retry is scheduled, and after `Failed`. Returns whether an attempt
    /// was started.
    pub fn connect(&self) -> bool {
        let mut st = self.shared.state.lock();
        match st.state {
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting => {
                debug!(state = st.state.as_str(), "connect ignored, connection already live");
                false
            }
            ConnectionState::Failed => {
                warn!("connect ignored after failure, use reconnect");
                false
            }
            ConnectionState::Idle | ConnectionState::Closed => {
                st.attempt = 0;
                st.last_error = None;
                self.shared.begin_attempt(&mut st);
                true
            }
        }
    }

    /// Tear down whatever exists and start over with a fresh attempt count.
    pub fn reconnect(&self) {
        let mut st = self.shared.state.lock();
        info!(state = st.state.as_str(), "reconnect requested");
        st.teardown();
        self.shared.scheduler.cancel(TimerKind::Reconnect);
        st.attempt = 0;
        st.last_error = None;
        let _ = self.shared.signal_tx.send(ConnectionSignal::Reset);
        self.shared.begin_attempt(&mut st);
    }

    /// Close with the normal-closure code and suppress any pending retry.
    pub fn disconnect(&self) {
        let mut st = self.shared.state.lock();
        if st.state == ConnectionState::Closed && st.live.is_none() {
            return;
        }
        info!(state = st.state.as_str(), "disconnecting");
        st.teardown();
        self.shared.scheduler.cancel(TimerKind::Reconnect);
        st.state = ConnectionState::Closed;
        st.retry_in = None;
        self.shared.publish(&st);
    }

    /// Hand a frame to the open transport. Returns false when not open or
    /// when the writer is backed up; the frame is not retried.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        match frame.to_json() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(frame_type = frame.frame_type(), error = %e, "failed to encode frame");
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        let st = self.shared.state.lock();
        if st.state != ConnectionState::Open {
            return false;
        }
        let Some(tx) = st.outbound.as_ref() else {
            return false;
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().state
    }

    /// Latest-value view of the connection status for UI consumers.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }
}

impl FrameSink for ConnectionManager {
    fn send_frame(&self, frame: &OutboundFrame) -> bool {
        self.send(frame)
    }
}

impl Shared {
    fn publish(&self, st: &ConnState) {
        let status = st.snapshot();
        self.status_tx.send_replace(status.clone());
        let _ = self.signal_tx.send(ConnectionSignal::Status(status));
    }

    fn begin_attempt(self: &Arc<Self>, st: &mut ConnState) {
        st.generation += 1;
        let token = CancellationToken::new();
        st.live = Some(token.clone());
        st.state = ConnectionState::Connecting;
        st.retry_in = None;
        self.publish(st);
        tokio::spawn(drive(Arc::clone(self), st.generation, token));
    }

    fn on_open(&self, generation: u64, connection_id: &ConnectionId, tx: mpsc::Sender<String>) -> bool {
        let mut st = self.state.lock();
        if st.generation != generation {
            return false;
        }
        st.state = ConnectionState::Open;
        st.attempt = 0;
        st.retry_in = None;
        st.last_error = None;
        st.outbound = Some(tx);
        self.metrics.counter_inc("sync.transport_opened", &[], 1);
        info!(connection = %connection_id, "connection open");
        let _ = self.signal_tx.send(ConnectionSignal::Opened);
        self.publish(&st);
        true
    }

    fn on_frame(&self, generation: u64, text: String) {
        let st = self.state.lock();
        if st.generation != generation || st.state != ConnectionState::Open {
            return;
        }
        self.metrics.counter_inc("sync.frames_received", &[], 1);
        let _ = self.signal_tx.send(ConnectionSignal::Frame(text));
    }

    fn on_closed(self: &Arc<Self>, generation: u64, closure: Closure) {
        let mut st = self.state.lock();
        if st.generation != generation {
            debug!(generation, "ignoring close from superseded transport");
            return;
        }
        st.live = None;
        st.outbound = None;

        if let Closure::Code {
            code: NORMAL_CLOSURE,
            reason,
        } = &closure
        {
            info!(reason = %reason, "connection closed normally");
            st.state = ConnectionState::Closed;
            st.retry_in = None;
            self.publish(&st);
            return;
        }

        warn!(
            state = st.state.as_str(),
            attempt = st.attempt,
            kind = closure.kind(),
            error = %closure.describe(),
            "connection lost"
        );
        st.last_error = Some(closure.describe());
        self.schedule_retry(&mut st);
    }

    fn schedule_retry(self: &Arc<Self>, st: &mut ConnState) {
        let Some(delay) = self.config.backoff.next_delay(st.attempt) else {
            st.state = ConnectionState::Failed;
            st.retry_in = None;
            self.metrics.counter_inc("sync.connection_failed", &[], 1);
            warn!(attempts = st.attempt, "reconnect attempts exhausted, giving up");
            self.publish(st);
            return;
        };

        st.attempt += 1;
        st.state = ConnectionState::Reconnecting;
        st.retry_in = Some(delay);
        self.metrics.counter_inc("sync.reconnect_scheduled", &[], 1);
        self.metrics
            .histogram_observe("sync.backoff_delay_ms", &[], delay.as_millis() as f64);
        info!(
            attempt = st.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let shared = Arc::clone(self);
        let generation = st.generation;
        self.scheduler
            .schedule_once(TimerKind::Reconnect, delay, move || async move {
                shared.retry(generation);
            });
        self.publish(st);
    }

    fn retry(self: &Arc<Self>, generation: u64) {
        let mut st = self.state.lock();
        if st.state != ConnectionState::Reconnecting || st.generation != generation {
            return;
        }
        self.begin_attempt(&mut st);
    }
}

/// One connect attempt and, if it succeeds, the transport's I/O loop.
async fn drive(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let connection_id = ConnectionId::new();
    debug!(connection = %connection_id, generation, "opening transport");

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = shared.connector.connect(&shared.handshake) => result,
    };
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            shared.on_closed(generation, Closure::Error(e));
            return;
        }
    };

    let (tx, mut outbound) = mpsc::channel(shared.config.outbound_queue.max(1));
    if !shared.on_open(generation, &connection_id, tx) {
        transport.close(NORMAL_CLOSURE, "superseded").await;
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                transport.close(NORMAL_CLOSURE, "client closing").await;
                debug!(connection = %connection_id, "transport closed by client");
                return;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = transport.send_text(text).await {
                    shared.on_closed(generation, Closure::Error(e));
                    return;
                }
            }
            event = transport.next_event() => match event {
                TransportEvent::Text(text) => shared.on_frame(generation, text),
                TransportEvent::Closed { code, reason } => {
                    shared.on_closed(generation, Closure::Code { code, reason });
                    return;
                }
                TransportEvent::Failed(e) => {
                    shared.on_closed(generation, Closure::Error(e));
                    return;
                }
            },
        }
    }
}
