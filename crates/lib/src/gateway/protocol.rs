//! Gateway WebSocket protocol: one JSON object per frame, discriminated by `type`.

use crate::agent::Usage;
use serde::{Deserialize, Serialize};

/// Client -> gateway frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Chat(ChatParams),
    Reset(ResetParams),
}

/// `{type:"chat", message, sessionId?, confirmedActionId?}` plus optional prompt/persistence context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParams {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_action_id: Option<String>,
    /// Overrides the org from the upgrade request for the prompt's active-org line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Initial title for the persisted conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Gateway -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "session.id", rename_all = "camelCase")]
    SessionId { session_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "agent.action")]
    AgentAction {
        action: ActionKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        status: ActionStatus,
    },
    #[serde(rename = "agent.text")]
    AgentText { text: String, status: TextStatus },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<WireUsage>,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "session.reset")]
    SessionReset,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    /// `turn.completed` or `error`: the last frame of a turn.
    pub fn ends_turn(&self) -> bool {
        matches!(self, ServerFrame::TurnCompleted { .. } | ServerFrame::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Command,
    ToolCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextStatus {
    Streaming,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

impl From<Usage> for WireUsage {
    fn from(u: Usage) -> Self {
        Self {
            input_tokens: u.input_tokens,
            cached_input_tokens: u.cached_input_tokens,
            output_tokens: u.output_tokens,
        }
    }
}

/// Why an inbound frame was rejected. The Display text is sent back in an `error` frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Unknown message type")]
    UnknownType,
    #[error("Invalid {kind} frame: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

/// Parse a text frame, distinguishing bad JSON, unknown types, and malformed known frames.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;
    let kind = match value.get("type").and_then(|v| v.as_str()) {
        Some("chat") => "chat",
        Some("reset") => "reset",
        _ => return Err(FrameError::UnknownType),
    };
    serde_json::from_value(value).map_err(|e| FrameError::Invalid {
        kind,
        reason: e.to_string(),
    })
}
