//! Confirm-before-write: decoding structured replies and the ledger of issued action ids.
//!
//! The agent proposes a mutation by ending its turn with a single JSON object of `type: "confirm"`.
//! Replies are decoded best-effort: whole-string parse, then the outermost `{...}` span, else prose.
//! The ledger records every proposed action per session so a confirmation can be checked and consumed once.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Message prefix the client sends when approving an action (`CONFIRM_ACTION: <id>`).
pub const CONFIRM_PREFIX: &str = "CONFIRM_ACTION:";

/// A proposed mutating action awaiting explicit user approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPayload {
    #[serde(rename = "id")]
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// API path or query the action targets (`path` is accepted as an alias).
    #[serde(default, alias = "path", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl ConfirmPayload {
    /// Short human-readable label: title, then summary, then `METHOD target`.
    pub fn label(&self) -> String {
        if let Some(t) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return t.trim().to_string();
        }
        if let Some(s) = self.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            return s.trim().to_string();
        }
        format!(
            "{} {}",
            self.method.as_deref().unwrap_or("ACTION"),
            self.target.as_deref().unwrap_or(&self.action_id)
        )
    }
}

/// Result of decoding the final text of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredReply {
    /// `{"type":"confirm", ...}`
    Confirm(ConfirmPayload),
    /// `{"type":"message","text":...}`; carries the inner text.
    Message(String),
    /// Anything else; carries the original text.
    Prose(String),
}

impl StructuredReply {
    /// Display text for the reply.
    pub fn text(&self) -> String {
        match self {
            StructuredReply::Confirm(p) => p.summary.clone().unwrap_or_else(|| p.label()),
            StructuredReply::Message(t) | StructuredReply::Prose(t) => t.clone(),
        }
    }
}

/// Decode agent output into a confirm payload, a message, or plain prose.
pub fn decode_reply(text: &str) -> StructuredReply {
    let trimmed = text.trim();
    let object = parse_object(trimmed).or_else(|| outermost_object(trimmed).and_then(parse_object));
    let Some(object) = object else {
        return StructuredReply::Prose(text.to_string());
    };
    match object.get("type").and_then(|v| v.as_str()) {
        Some("confirm") => match serde_json::from_value::<ConfirmPayload>(object.clone()) {
            Ok(p) if !p.action_id.trim().is_empty() => StructuredReply::Confirm(p),
            Ok(_) | Err(_) => {
                log::debug!("confirm reply without a usable id, treating as prose");
                StructuredReply::Prose(text.to_string())
            }
        },
        Some("message") => match object.get("text").and_then(|v| v.as_str()) {
            Some(t) => StructuredReply::Message(t.to_string()),
            None => StructuredReply::Prose(text.to_string()),
        },
        _ => StructuredReply::Prose(text.to_string()),
    }
}

fn parse_object(s: &str) -> Option<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}

fn outermost_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    s.get(start..=end)
}

/// Extract the id from a `CONFIRM_ACTION: <id>` message (prefix is case-insensitive).
pub fn confirmed_id_from_message(message: &str) -> Option<String> {
    let trimmed = message.trim();
    let head = trimmed.get(..CONFIRM_PREFIX.len())?;
    if !head.eq_ignore_ascii_case(CONFIRM_PREFIX) {
        return None;
    }
    let id = trimmed[CONFIRM_PREFIX.len()..].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("action {0} was not proposed in this session")]
    Unknown(String),
    #[error("action {0} was already confirmed")]
    Consumed(String),
}

#[derive(Debug, Clone)]
enum ActionState {
    Pending(ConfirmPayload),
    Consumed,
}

/// Per-session record of proposed actions, consumed at most once.
#[derive(Default)]
pub struct ActionLedger {
    inner: RwLock<HashMap<SessionId, HashMap<String, ActionState>>>,
}

impl ActionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a proposed action. A re-proposal of the same id replaces a pending one.
    pub async fn record(&self, session_id: &str, payload: ConfirmPayload) {
        let mut g = self.inner.write().await;
        let actions = g.entry(session_id.to_string()).or_default();
        if matches!(actions.get(&payload.action_id), Some(ActionState::Consumed)) {
            log::warn!(
                "session {}: action id {} reused after confirmation; ignoring",
                session_id,
                payload.action_id
            );
            return;
        }
        actions.insert(payload.action_id.clone(), ActionState::Pending(payload));
    }

    /// Atomically consume a pending action.
    pub async fn consume(
        &self,
        session_id: &str,
        action_id: &str,
    ) -> Result<ConfirmPayload, LedgerError> {
        let mut g = self.inner.write().await;
        let state = g
            .get_mut(session_id)
            .and_then(|actions| actions.get_mut(action_id))
            .ok_or_else(|| LedgerError::Unknown(action_id.to_string()))?;
        match std::mem::replace(state, ActionState::Consumed) {
            ActionState::Pending(payload) => Ok(payload),
            ActionState::Consumed => Err(LedgerError::Consumed(action_id.to_string())),
        }
    }

    /// Drop everything recorded for a session (reset or eviction).
    pub async fn forget_session(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIRM: &str = r#"{"type":"confirm","id":"a1","title":"Delete project","summary":"Deletes project P","method":"DELETE","path":"/api/projects/P"}"#;

    #[test]
    fn decodes_clean_confirm() {
        let StructuredReply::Confirm(p) = decode_reply(CONFIRM) else {
            panic!("expected confirm");
        };
        assert_eq!(p.action_id, "a1");
        assert_eq!(p.method.as_deref(), Some("DELETE"));
        assert_eq!(p.target.as_deref(), Some("/api/projects/P"));
        assert_eq!(p.label(), "Delete project");
    }

    #[test]
    fn decodes_confirm_wrapped_in_prose() {
        let text = format!("Sure, here is the action:\n```json\n{}\n```\nPlease approve.", CONFIRM);
        assert!(matches!(decode_reply(&text), StructuredReply::Confirm(p) if p.action_id == "a1"));
    }

    #[test]
    fn decodes_message_object() {
        assert_eq!(
            decode_reply(r#"{"type":"message","text":"You have **3** projects."}"#),
            StructuredReply::Message("You have **3** projects.".to_string())
        );
    }

    #[test]
    fn falls_back_to_prose() {
        for text in [
            "plain answer",
            "braces { not json }",
            r#"{"type":"confirm","title":"no id"}"#,
            r#"{"type":"other"}"#,
            "} backwards {",
        ] {
            assert_eq!(decode_reply(text), StructuredReply::Prose(text.to_string()));
        }
    }

    #[test]
    fn confirm_prefix_parsing() {
        assert_eq!(confirmed_id_from_message("CONFIRM_ACTION: a1").as_deref(), Some("a1"));
        assert_eq!(confirmed_id_from_message("confirm_action:a1 ").as_deref(), Some("a1"));
        assert_eq!(confirmed_id_from_message("CONFIRM_ACTION:   "), None);
        assert_eq!(confirmed_id_from_message("please confirm_action: a1"), None);
        assert_eq!(confirmed_id_from_message("ok"), None);
    }

    #[tokio::test]
    async fn ledger_consumes_once_per_session() {
        let ledger = ActionLedger::new();
        let StructuredReply::Confirm(p) = decode_reply(CONFIRM) else {
            panic!("expected confirm");
        };
        ledger.record("s1", p.clone()).await;

        assert_eq!(
            ledger.consume("s2", "a1").await,
            Err(LedgerError::Unknown("a1".to_string()))
        );
        assert_eq!(ledger.consume("s1", "a1").await, Ok(p.clone()));
        assert_eq!(
            ledger.consume("s1", "a1").await,
            Err(LedgerError::Consumed("a1".to_string()))
        );

        ledger.record("s1", p).await;
        assert!(ledger.consume("s1", "a1").await.is_err());

        ledger.forget_session("s1").await;
        assert_eq!(
            ledger.consume("s1", "a1").await,
            Err(LedgerError::Unknown("a1".to_string()))
        );
    }
}
