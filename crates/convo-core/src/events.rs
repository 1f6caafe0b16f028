//! Typed realtime events and their idempotency keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::frames::InboundFrame;
use crate::ids::{ConversationId, EventKey};
use crate::model::{composite_key, Message, MessageStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    NewConversation,
    MessageStatus,
    Typing,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_message" => Some(Self::NewMessage),
            "new_conversation" => Some(Self::NewConversation),
            "message_status" => Some(Self::MessageStatus),
            "typing" => Some(Self::Typing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::NewConversation => "new_conversation",
            Self::MessageStatus => "message_status",
            Self::Typing => "typing",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    /// `message` is absent when the server only announces that something
    /// arrived; the timeline then has to be fetched.
    NewMessage {
        conversation_id: ConversationId,
        message: Option<Message>,
    },
    NewConversation {
        conversation_id: ConversationId,
        message: Option<Message>,
    },
    MessageStatus {
        conversation_id: Option<ConversationId>,
        /// Any identifier of the target message (primary or provider id).
        message_id: String,
        status: MessageStatus,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

/// An inbound event after parsing, keyed for deduplication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationEvent {
    pub id: EventKey,
    pub payload: EventPayload,
    pub received_at: DateTime<Utc>,
}

/// Result of decoding one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Event(NotificationEvent),
    /// Well-formed frame with a `type` this client does not handle.
    Unknown(String),
}

impl NotificationEvent {
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::NewMessage { .. } => EventKind::NewMessage,
            EventPayload::NewConversation { .. } => EventKind::NewConversation,
            EventPayload::MessageStatus { .. } => EventKind::MessageStatus,
            EventPayload::Typing { .. } => EventKind::Typing,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match &self.payload {
            EventPayload::NewMessage {
                conversation_id, ..
            }
            | EventPayload::NewConversation {
                conversation_id, ..
            } => Some(conversation_id),
            EventPayload::MessageStatus {
                conversation_id, ..
            } => conversation_id.as_ref(),
            EventPayload::Typing {
                conversation_id, ..
            } => Some(conversation_id),
        }
    }

    /// Buffered events sharing this key replace each other instead of
    /// queueing side by side. Only status updates supersede.
    pub fn supersede_key(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::MessageStatus { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Whether the event changes which conversations exist or how they sort.
    pub fn affects_conversation_list(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::NewMessage | EventKind::NewConversation
        )
    }

    pub fn decode(raw: &str, received_at: DateTime<Utc>) -> Result<Decoded, FrameError> {
        let frame: InboundFrame = serde_json::from_str(raw)?;
        Self::from_frame(frame, received_at)
    }

    /// Validate a parsed frame and derive its idempotency key.
    ///
    /// Keys are namespaced by event type. Status events are keyed by
    /// `(message, status)` so a newer status is never a duplicate of an older
    /// one. Everything else uses the server event id, then the message's own
    /// id, then a hash of conversation, timestamp and content.
    pub fn from_frame(
        frame: InboundFrame,
        received_at: DateTime<Utc>,
    ) -> Result<Decoded, FrameError> {
        let Some(kind) = EventKind::parse(&frame.kind) else {
            return Ok(Decoded::Unknown(frame.kind));
        };

        let (key, payload) = match kind {
            EventKind::NewMessage => {
                let (conversation_id, message, stable) = split_body(&frame, received_at)?;
                let key = frame.id.unwrap_or(stable);
                (
                    key,
                    EventPayload::NewMessage {
                        conversation_id,
                        message,
                    },
                )
            }
            EventKind::NewConversation => {
                let (conversation_id, message, stable) = split_body(&frame, received_at)?;
                let key = frame.id.unwrap_or(stable);
                (
                    key,
                    EventPayload::NewConversation {
                        conversation_id,
                        message,
                    },
                )
            }
            EventKind::MessageStatus => {
                let message_id = frame
                    .message_id
                    .ok_or(FrameError::MissingField("messageId"))?;
                let status = frame.status.ok_or(FrameError::MissingField("status"))?;
                let key = format!("{message_id}:{}", status.as_str());
                (
                    key,
                    EventPayload::MessageStatus {
                        conversation_id: frame.conversation_id,
                        message_id,
                        status,
                    },
                )
            }
            EventKind::Typing => {
                let conversation_id = frame
                    .conversation_id
                    .ok_or(FrameError::MissingField("conversationId"))?;
                let is_typing = frame.is_typing.ok_or(FrameError::MissingField("isTyping"))?;
                let key = frame.id.unwrap_or_else(|| {
                    composite_key(
                        Some(&conversation_id),
                        frame.timestamp,
                        if is_typing { "on" } else { "off" },
                    )
                });
                (
                    key,
                    EventPayload::Typing {
                        conversation_id,
                        is_typing,
                    },
                )
            }
        };

        Ok(Decoded::Event(NotificationEvent {
            id: EventKey::from_raw(format!("{}:{key}", kind.as_str())),
            payload,
            received_at,
        }))
    }
}

/// Conversation, optional message and fallback key of a frame that may
/// carry a message body. The body's own conversation id wins over the
/// frame's.
fn split_body(
    frame: &InboundFrame,
    received_at: DateTime<Utc>,
) -> Result<(ConversationId, Option<Message>, String), FrameError> {
    let body = frame.message.as_ref();
    let conversation_id = body
        .and_then(|m| m.conversation_id.clone())
        .or_else(|| frame.conversation_id.clone())
        .ok_or(FrameError::MissingField("conversationId"))?;
    let stable = match body {
        Some(m) => m.stable_id(Some(&conversation_id), frame.timestamp),
        None => composite_key(Some(&conversation_id), frame.timestamp, ""),
    };
    let message = body
        .cloned()
        .and_then(|m| m.into_message(Some(&conversation_id), frame.timestamp, received_at));
    Ok((conversation_id, message, stable))
}
