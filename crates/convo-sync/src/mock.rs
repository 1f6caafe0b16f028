//! Scripted connector and REST collaborator for deterministic tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use convo_core::api::{ConversationApi, SendAck};
use convo_core::errors::{ApiError, TransportError};
use convo_core::frames::ABNORMAL_CLOSURE;
use convo_core::ids::{ConversationId, MessageId};
use convo_core::model::{Conversation, ConversationStatus, Message, MessageStatus};

use crate::transport::{Connector, Handshake, Transport, TransportEvent};

/// Outcome of one `connect` call.
#[derive(Clone, Debug)]
pub enum ConnectOutcome {
    Accept,
    Fail(TransportError),
}

/// Connector whose attempts follow a script. With an empty script every
/// attempt is accepted, unless a persistent failure is set.
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    persistent_failure: Mutex<Option<TransportError>>,
    remotes: Mutex<Vec<MockRemote>>,
    attempts: AtomicUsize,
    connect_delay: Option<Duration>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt fails with `error`.
    pub fn failing(error: TransportError) -> Self {
        let connector = Self::default();
        connector.set_failing(Some(error));
        connector
    }

    /// Each attempt takes `delay` before resolving.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn push(&self, outcome: ConnectOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn set_failing(&self, error: Option<TransportError>) {
        *self.persistent_failure.lock() = error;
    }

    /// Number of `connect` calls made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of transports handed out.
    pub fn transports(&self) -> usize {
        self.remotes.lock().len()
    }

    pub fn remote(&self, index: usize) -> Option<MockRemote> {
        self.remotes.lock().get(index).cloned()
    }

    pub fn last_remote(&self) -> Option<MockRemote> {
        self.remotes.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _handshake: &Handshake) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().pop_front();
        let outcome = scripted.unwrap_or_else(|| match self.persistent_failure.lock().clone() {
            Some(error) => ConnectOutcome::Fail(error),
            None => ConnectOutcome::Accept,
        });
        if let ConnectOutcome::Fail(error) = outcome {
            return Err(error);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));
        self.remotes.lock().push(MockRemote {
            inbound: inbound_tx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(MockTransport {
            inbound: inbound_rx,
            sent,
            closed,
        }))
    }
}

/// Server side of one mock transport.
#[derive(Clone)]
pub struct MockRemote {
    inbound: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<u16>>>,
}

impl MockRemote {
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn push_json(&self, value: serde_json::Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Server-initiated close.
    pub fn close(&self, code: u16) -> bool {
        self.inbound
            .send(TransportEvent::Closed {
                code,
                reason: String::new(),
            })
            .is_ok()
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.inbound.send(TransportEvent::Failed(error)).is_ok()
    }

    /// Frames the client wrote.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Code the client closed with, if it closed.
    pub fn closed_with(&self) -> Option<u16> {
        *self.closed.lock()
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.lock().is_some() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "remote dropped".into(),
            })
    }

    async fn close(&mut self, code: u16, _reason: &str) {
        self.closed.lock().get_or_insert(code);
    }
}

/// In-memory REST collaborator.
#[derive(Default)]
pub struct MockConversationApi {
    conversations: Mutex<Vec<Conversation>>,
    messages: Mutex<HashMap<ConversationId, Vec<Message>>>,
    sent: Mutex<Vec<(ConversationId, String)>>,
    fail_next: Mutex<Option<ApiError>>,
    list_calls: AtomicUsize,
    message_calls: AtomicUsize,
    list_delay: Option<Duration>,
}

impl MockConversationApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each list call takes `delay` before answering.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock() = conversations;
    }

    /// Replace one conversation (matched by id) or add it.
    pub fn upsert_conversation(&self, conversation: Conversation) {
        let mut all = self.conversations.lock();
        match all.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => all.push(conversation),
        }
    }

    pub fn set_messages(&self, conversation_id: ConversationId, messages: Vec<Message>) {
        self.messages.lock().insert(conversation_id, messages);
    }

    pub fn fail_next(&self, error: ApiError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn message_calls(&self) -> usize {
        self.message_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(ConversationId, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ConversationApi for MockConversationApi {
    async fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        _page: u32,
    ) -> Result<Vec<Conversation>, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        Ok(self
            .conversations
            .lock()
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        Ok(self
            .messages
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<SendAck, ApiError> {
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let mut sent = self.sent.lock();
        sent.push((conversation_id.clone(), content.to_string()));
        Ok(SendAck {
            message_id: MessageId::from_raw(format!("srv_{}", sent.len())),
            external_id: None,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
        })
    }
}
