//! HTTP implementation of the REST collaborator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use convo_core::api::{ConversationApi, SendAck};
use convo_core::errors::ApiError;
use convo_core::ids::ConversationId;
use convo_core::model::{Conversation, ConversationStatus, Message};
use convo_settings::ApiSettings;

/// List endpoints answer with a bare array or with `{ "data": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Wrapped { data: items } => items,
        }
    }
}

pub struct HttpConversationApi {
    client: reqwest::Client,
    base_url: Url,
    token: SecretString,
    timeout: Duration,
}

impl HttpConversationApi {
    pub fn new(base_url: &str, token: SecretString) -> Result<Self, ApiError> {
        // A trailing slash makes `Url::join` append instead of replacing
        // the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_owned()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ApiError::Network(format!("invalid api url {base_url}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token,
            timeout: Duration::from_secs(15),
        })
    }

    pub fn from_settings(settings: &ApiSettings, token: SecretString) -> Result<Self, ApiError> {
        Ok(Self::new(&settings.base_url, token)?
            .with_timeout(Duration::from_millis(settings.request_timeout_ms)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share a connection pool with other clients.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::Network(format!("api url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn list_url(&self, status: Option<ConversationStatus>, page: u32) -> Result<Url, ApiError> {
        let mut url = self.url(&["conversations"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(status) = status {
                query.append_pair("status", status.as_str());
            }
            query.append_pair("page", &page.to_string());
        }
        Ok(url)
    }

    fn messages_url(&self, conversation_id: &ConversationId) -> Result<Url, ApiError> {
        self.url(&["conversations", conversation_id.as_str(), "messages"])
    }

    fn headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token.expose_secret()))
            .map_err(|e| ApiError::Unauthorized(format!("invalid token header: {e}")))?;
        value.set_sensitive(true);
        let _ = headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ApiError> {
        let response = request
            .headers(self.headers()?)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = ApiError::from_status(status.as_u16(), body);
            warn!(status = status.as_u16(), kind = error.error_kind(), "api request failed");
            return Err(error);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(
        &self,
        status: Option<ConversationStatus>,
        page: u32,
    ) -> Result<Vec<Conversation>, ApiError> {
        let url = self.list_url(status, page)?;
        debug!(%url, "listing conversations");
        let body: ListBody<Conversation> = self.execute(self.client.get(url)).await?;
        Ok(body.into_vec())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, ApiError> {
        let url = self.messages_url(conversation_id)?;
        debug!(%url, "fetching messages");
        let body: ListBody<Message> = self.execute(self.client.get(url)).await?;
        Ok(body.into_vec())
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<SendAck, ApiError> {
        let url = self.messages_url(conversation_id)?;
        debug!(conversation_id = %conversation_id, "sending message");
        let request = self
            .client
            .post(url)
            .json(&serde_json::json!({ "content": content }));
        self.execute(request).await
    }
}
