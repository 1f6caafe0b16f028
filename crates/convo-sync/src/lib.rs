//! # convo-sync
//!
//! Realtime conversation sync: one self-healing connection per session,
//! deduplicated event intake, and idempotent reconciliation of the
//! conversation list and the open conversation's timeline.
//!
//! ```text
//! transport frames → ConnectionManager → NotificationDispatcher
//!                  → {ConversationListReconciler, MessageTimelineReconciler}
//!                  → watch snapshots
//! ```
//!
//! [`SyncSession`] wires the parts together behind `init()`/`dispose()`.

pub mod backoff;
pub mod connection;
pub mod conversations;
pub mod dispatcher;
pub mod mock;
pub mod queue;
pub mod rest;
pub mod scheduler;
pub mod session;
pub mod timeline;
pub mod transport;
pub mod typing;
pub mod ws;

pub use backoff::BackoffPolicy;
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionSignal, ConnectionState, ConnectionStatus,
};
pub use conversations::{ConversationListReconciler, RefetchRequest};
pub use dispatcher::{IngestOutcome, NotificationDispatcher};
pub use queue::{EventQueue, PushOutcome};
pub use rest::HttpConversationApi;
pub use scheduler::{TaskScheduler, TimerKind};
pub use session::{SessionConfig, SyncSession};
pub use timeline::{
    is_consecutive, is_consecutive_within, MessageTimelineReconciler, TimelineChange,
    TimelineSnapshot, GROUPING_WINDOW,
};
pub use transport::{Connector, FrameSink, Handshake, Transport, TransportEvent};
pub use typing::TypingNotifier;
pub use ws::{WebSocketConnector, WebSocketTransport};
