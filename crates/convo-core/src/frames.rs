//! Wire frames exchanged over the persistent connection.
//!
//! Inbound frames are parsed leniently (every field optional) and validated
//! when they are turned into typed events; see [`crate::events`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{wire_id, BusinessId, ConversationId, MessageId};
use crate::model::{
    composite_key, wire_time, Message, MessageDirection, MessageStatus, MessageType,
};

/// Close code for an intentional, clean shutdown. Never retried.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code used when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Raw server → client frame.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    /// Server-assigned event id, when the server provides one.
    #[serde(
        default,
        deserialize_with = "wire_id::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePayload>,
    #[serde(
        default,
        deserialize_with = "wire_id::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    #[serde(
        default,
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Message body embedded in `new_message` and `new_conversation` frames.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(
        default,
        deserialize_with = "wire_id::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "providerMessageId",
        alias = "whatsappMessageId",
        deserialize_with = "wire_id::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<MessageDirection>,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(
        default,
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessagePayload {
    /// Best stable id for this message: server id, then provider id, then a
    /// composite of conversation, timestamp and content.
    pub fn stable_id(
        &self,
        conversation_id: Option<&ConversationId>,
        frame_ts: Option<DateTime<Utc>>,
    ) -> String {
        self.id
            .clone()
            .or_else(|| self.external_id.clone())
            .unwrap_or_else(|| {
                let conversation = self.conversation_id.as_ref().or(conversation_id);
                composite_key(conversation, self.timestamp.or(frame_ts), &self.content)
            })
    }

    /// Build the timeline model. Missing fields fall back to the enclosing
    /// frame; `received_at` is used only when no timestamp was sent at all.
    pub fn into_message(
        self,
        frame_conversation: Option<&ConversationId>,
        frame_ts: Option<DateTime<Utc>>,
        received_at: DateTime<Utc>,
    ) -> Option<Message> {
        let conversation_id = self
            .conversation_id
            .clone()
            .or_else(|| frame_conversation.cloned())?;
        let id = MessageId::from_raw(self.stable_id(Some(&conversation_id), frame_ts));
        let external_id = match (&self.id, self.external_id) {
            (Some(_), external) => external,
            (None, _) => None,
        };
        Some(Message {
            id,
            external_id,
            conversation_id,
            direction: self.direction.unwrap_or(MessageDirection::Inbound),
            kind: self.kind,
            content: self.content,
            status: self.status.unwrap_or(MessageStatus::Delivered),
            timestamp: self.timestamp.or(frame_ts).unwrap_or(received_at),
        })
    }
}

/// Client → server frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    /// First frame after connect when credentials are not sent in the URL.
    Auth { business_id: BusinessId, token: String },
}

impl OutboundFrame {
    pub fn typing(conversation_id: ConversationId, is_typing: bool) -> Self {
        Self::Typing {
            conversation_id,
            is_typing,
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Typing { .. } => "typing",
            Self::Auth { .. } => "auth",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
