//! Client-side protocol state: connection status, current session, local transcript,
//! the in-flight assistant message, and a pending confirmation.

use crate::confirm::{decode_reply, ConfirmPayload, StructuredReply, CONFIRM_PREFIX};
use crate::gateway::protocol::{ChatParams, ClientFrame, ResetParams, ServerFrame, TextStatus};
use crate::session::{ChatMessage, MessageKind, Role};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    Processing,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Processing => "processing",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected (status: {0})")]
    NotReady(ConnectionStatus),
    #[error("a turn is already in progress")]
    Busy,
    #[error("message is required")]
    EmptyMessage,
    #[error("no confirmation is pending")]
    NoPendingConfirmation,
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encoding frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    Header(String),
}

/// What changed after a frame or local action; consumed by the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Status(ConnectionStatus),
    Session(String),
    /// A step the agent started (command summary or tool name).
    Action(String),
    /// Latest snapshot of the in-flight assistant text.
    Text { text: String, done: bool },
    /// Final prose reply of a turn.
    Reply(String),
    /// The turn ended with a proposed action awaiting approval.
    Confirm(ConfirmPayload),
    /// The pending confirmation was canceled locally.
    Canceled(ConfirmPayload),
    Error(String),
    Reset,
}

#[derive(Debug)]
pub struct ClientState {
    status: ConnectionStatus,
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
    /// Index of the assistant message being streamed.
    pending: Option<usize>,
    pending_confirm: Option<ConfirmPayload>,
}

impl ClientState {
    /// Start in `connecting`, optionally resuming a stored session id.
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            session_id,
            messages: Vec::new(),
            pending: None,
            pending_confirm: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn pending_confirm(&self) -> Option<&ConfirmPayload> {
        self.pending_confirm.as_ref()
    }

    pub fn on_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn on_open(&mut self) {
        self.status = ConnectionStatus::Ready;
    }

    /// Transport closed or failed. An in-flight reply is frozen as an error; the session id is kept.
    pub fn on_disconnect(&mut self) {
        if let Some(i) = self.pending.take() {
            if let Some(m) = self.messages.get_mut(i) {
                m.kind = MessageKind::Error;
                if m.text.is_empty() {
                    m.text = "connection lost".to_string();
                }
            }
        }
        self.status = ConnectionStatus::Error;
    }

    /// Build a `chat` frame and move to `processing`.
    pub fn begin_chat(
        &mut self,
        message: &str,
        confirmed_action_id: Option<String>,
    ) -> Result<ClientFrame, ClientError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        match self.status {
            ConnectionStatus::Ready => {}
            ConnectionStatus::Processing => return Err(ClientError::Busy),
            other => return Err(ClientError::NotReady(other)),
        }
        self.messages.push(ChatMessage::user(message));
        self.messages.push(ChatMessage::assistant(String::new()));
        self.pending = Some(self.messages.len() - 1);
        self.status = ConnectionStatus::Processing;
        Ok(ClientFrame::Chat(ChatParams {
            message: message.to_string(),
            session_id: self.session_id.clone(),
            confirmed_action_id,
            ..ChatParams::default()
        }))
    }

    /// Approve the pending confirmation: a `CONFIRM_ACTION: <id>` chat carrying the id.
    pub fn approve(&mut self) -> Result<ClientFrame, ClientError> {
        let payload = self
            .pending_confirm
            .clone()
            .ok_or(ClientError::NoPendingConfirmation)?;
        let frame = self.begin_chat(
            &format!("{} {}", CONFIRM_PREFIX, payload.action_id),
            Some(payload.action_id.clone()),
        )?;
        self.pending_confirm = None;
        Ok(frame)
    }

    /// Cancel the pending confirmation locally; nothing is sent.
    pub fn cancel(&mut self) -> Result<ClientUpdate, ClientError> {
        let payload = self
            .pending_confirm
            .take()
            .ok_or(ClientError::NoPendingConfirmation)?;
        self.messages.push(ChatMessage::assistant(format!(
            "Canceled: {}",
            payload.label()
        )));
        Ok(ClientUpdate::Canceled(payload))
    }

    /// Forget the session locally. Returns the `reset` frame to send when there was one.
    /// Refused while a turn is in flight.
    pub fn reset(&mut self) -> Result<Option<ClientFrame>, ClientError> {
        if self.status == ConnectionStatus::Processing {
            return Err(ClientError::Busy);
        }
        self.messages.clear();
        self.pending = None;
        self.pending_confirm = None;
        Ok(self.session_id.take().map(|session_id| {
            ClientFrame::Reset(ResetParams {
                session_id: Some(session_id),
            })
        }))
    }

    /// Apply one server frame.
    pub fn apply(&mut self, frame: ServerFrame) -> Option<ClientUpdate> {
        match frame {
            ServerFrame::SessionId { session_id } => {
                self.session_id = Some(session_id.clone());
                Some(ClientUpdate::Session(session_id))
            }
            ServerFrame::TurnStarted => None,
            ServerFrame::AgentAction { command, tool, .. } => {
                let label = command.or(tool)?;
                if let Some(m) = self.pending_message() {
                    m.action_trace.push(label.clone());
                }
                Some(ClientUpdate::Action(label))
            }
            ServerFrame::AgentText { text, status } => {
                if let Some(m) = self.pending_message() {
                    m.text = text.clone();
                }
                Some(ClientUpdate::Text {
                    text,
                    done: status == TextStatus::Done,
                })
            }
            ServerFrame::TurnCompleted { text, .. } => Some(self.complete(text)),
            ServerFrame::Error { message } => {
                if let Some(i) = self.pending.take() {
                    if let Some(m) = self.messages.get_mut(i) {
                        m.kind = MessageKind::Error;
                        m.text = message.clone();
                    }
                }
                if self.status == ConnectionStatus::Processing {
                    self.status = ConnectionStatus::Ready;
                }
                Some(ClientUpdate::Error(message))
            }
            ServerFrame::SessionReset => Some(ClientUpdate::Reset),
        }
    }

    fn pending_message(&mut self) -> Option<&mut ChatMessage> {
        let i = self.pending?;
        self.messages.get_mut(i)
    }

    fn complete(&mut self, text: String) -> ClientUpdate {
        if self.status == ConnectionStatus::Processing {
            self.status = ConnectionStatus::Ready;
        }
        let streamed = self
            .pending_message()
            .map(|m| m.text.clone())
            .unwrap_or_default();
        let final_text = if text.trim().is_empty() { streamed } else { text };
        let reply = decode_reply(&final_text);
        let index = match self.pending.take() {
            Some(i) if i < self.messages.len() => i,
            _ => {
                self.messages
                    .push(ChatMessage::new(Role::Assistant, MessageKind::Message, ""));
                self.messages.len() - 1
            }
        };
        let message = &mut self.messages[index];
        message.text = reply.text();
        match reply {
            StructuredReply::Confirm(payload) => {
                message.kind = MessageKind::Confirm;
                message.confirm_payload = Some(payload.clone());
                self.pending_confirm = Some(payload.clone());
                ClientUpdate::Confirm(payload)
            }
            StructuredReply::Message(text) | StructuredReply::Prose(text) => {
                message.kind = MessageKind::Message;
                ClientUpdate::Reply(text)
            }
        }
    }
}
