//! Conversation persistence client (REST API `/api/chat/conversations`).
//! Create on the first completed turn of a session, update afterwards. Failures never affect the turn.

use crate::session::{ChatMessage, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_TITLE_CHARS: usize = 60;
const DEFAULT_TITLE: &str = "New conversation";

/// Caller identity captured from the WebSocket upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub bearer_token: Option<String>,
    pub org_id: Option<String>,
}

/// Conversation record as returned by the API.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConversationRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConversationBody<'a> {
    title: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("persistence api error: {0}")]
    Api(String),
}

/// Create-or-update of conversation records.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// `conversation_id` None creates a record; Some updates it. Returns the stored record.
    async fn save(
        &self,
        ctx: &RequestContext,
        conversation_id: Option<&str>,
        title: &str,
        messages: &[ChatMessage],
    ) -> Result<ConversationRecord, PersistenceError>;
}

/// HTTP implementation against the dashboard REST API.
#[derive(Clone)]
pub struct HttpConversationStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpConversationStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PersistenceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn conversations_url(&self, conversation_id: Option<&str>) -> String {
        match conversation_id {
            Some(id) => format!("{}/api/chat/conversations/{}", self.base_url, id),
            None => format!("{}/api/chat/conversations", self.base_url),
        }
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn save(
        &self,
        ctx: &RequestContext,
        conversation_id: Option<&str>,
        title: &str,
        messages: &[ChatMessage],
    ) -> Result<ConversationRecord, PersistenceError> {
        let url = self.conversations_url(conversation_id);
        let body = ConversationBody { title, messages };
        let mut req = match conversation_id {
            Some(_) => self.client.put(&url),
            None => self.client.post(&url),
        }
        .json(&body);
        if let Some(ref token) = ctx.bearer_token {
            req = req.bearer_auth(token);
        }
        if let Some(ref org) = ctx.org_id {
            req = req.header("X-Org-Id", org);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(PersistenceError::Api(format!("{} {}", status, body)));
        }
        Ok(res.json().await?)
    }
}

/// Title for a new conversation: first user message, truncated.
pub fn default_title(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .find(|m| m.role == Role::User && !m.text.trim().is_empty())
        .map(|m| m.text.trim().chars().take(MAX_TITLE_CHARS).collect())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}
