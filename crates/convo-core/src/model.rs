use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{wire_id, ConversationId, MessageId};

/// Lifecycle bucket of a conversation on the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }
}

/// Who the business is talking to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactIdentity {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ContactIdentity {
    /// Name to render: display name when known, phone number otherwise.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.phone_number)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub contact: ContactIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(
        default,
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub status: ConversationStatus,
}

impl Conversation {
    /// Fold a freshly fetched copy of this conversation into the cached one.
    /// Optional fields the server left out keep their cached value.
    pub fn merge_from(&mut self, fresh: Conversation) {
        if !fresh.contact.phone_number.is_empty() {
            self.contact.phone_number = fresh.contact.phone_number;
        }
        if fresh.contact.display_name.is_some() {
            self.contact.display_name = fresh.contact.display_name;
        }
        if fresh.last_message_preview.is_some() {
            self.last_message_preview = fresh.last_message_preview;
        }
        if fresh.last_message_at.is_some() {
            self.last_message_at = fresh.last_message_at;
        }
        self.unread_count = fresh.unread_count;
        self.status = fresh.status;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    Document,
    Template,
    Interactive,
    Location,
    Sticker,
    #[serde(other)]
    Unknown,
}

/// Delivery status of a single message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Sending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 0,
        }
    }

    /// Whether moving from `self` to `next` advances along
    /// sending → sent → delivered → read. `failed` always applies and a
    /// failed message may be picked up again.
    pub fn advances_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (_, Self::Failed) | (Self::Failed, _) => *self != next,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Id assigned by the messaging provider, when it differs from `id`.
    #[serde(
        default,
        alias = "providerMessageId",
        alias = "whatsappMessageId",
        deserialize_with = "wire_id::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub external_id: Option<String>,
    pub conversation_id: ConversationId,
    pub direction: MessageDirection,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub content: String,
    pub status: MessageStatus,
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Every id this message may be referenced by, primary first.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.id.as_str()).chain(self.external_id.as_deref())
    }

    pub fn has_identifier(&self, id: &str) -> bool {
        self.identifiers().any(|known| known == id)
    }

    pub fn shares_identifier(&self, other: &Message) -> bool {
        other.identifiers().any(|id| self.has_identifier(id))
    }
}

/// Deterministic fallback key for content that arrived without any id.
/// The same `(conversation, timestamp, content)` triple always hashes to the
/// same key.
pub fn composite_key(
    conversation_id: Option<&ConversationId>,
    timestamp: Option<DateTime<Utc>>,
    content: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.map(|c| c.as_str()).unwrap_or_default());
    hasher.update([0x1fu8]);
    hasher.update(
        timestamp
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default(),
    );
    hasher.update([0x1fu8]);
    hasher.update(content);
    let digest = format!("{:x}", hasher.finalize());
    format!("cmp_{}", &digest[..32])
}

/// Wire timestamps: integer epoch milliseconds or RFC 3339 strings on the
/// way in, epoch milliseconds on the way out.
pub mod wire_time {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Millis(i64),
        Text(String),
    }

    fn resolve(raw: RawTime) -> Option<DateTime<Utc>> {
        match raw {
            RawTime::Millis(ms) => DateTime::from_timestamp_millis(ms),
            RawTime::Text(text) => match text.parse::<i64>() {
                Ok(ms) => DateTime::from_timestamp_millis(ms),
                Err(_) => DateTime::parse_from_rfc3339(&text)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            },
        }
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(ts.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        resolve(RawTime::deserialize(d)?).ok_or_else(|| D::Error::custom("invalid timestamp"))
    }

    pub mod option {
        use super::*;
        use serde::de::Error as _;

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_some(&ts.timestamp_millis()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<RawTime>::deserialize(d)? {
                Some(raw) => resolve(raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom("invalid timestamp")),
                None => Ok(None),
            }
        }
    }
}
