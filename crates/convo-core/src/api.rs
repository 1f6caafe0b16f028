use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::ids::{wire_id, ConversationId, MessageId};
use crate::model::{
    wire_time, Conversation, ConversationStatus, Message, MessageDirection, MessageStatus,
    MessageType,
};

/// Server acknowledgement for an outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub message_id: MessageId,
    #[serde(
        default,
        alias = "providerMessageId",
        alias = "whatsappMessageId",
        deserialize_with = "wire_id::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_id: Option<String>,
    pub status: MessageStatus,
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
}

impl SendAck {
    /// The timeline entry for the message this ack confirms.
    pub fn into_message(self, conversation_id: ConversationId, content: String) -> Message {
        Message {
            id: self.message_id,
            external_id: self.external_id,
            conversation_id,
            direction: MessageDirection::Outbound,
            kind: MessageType::Text,
            content,
            status: self.status,
            timestamp: self.timestamp,
        }
    }
}

/// REST collaborator backing the realtime caches.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        page: u32,
    ) -> Result<Vec<Conversation>, ApiError>;

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError>;

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<SendAck, ApiError>;
}
