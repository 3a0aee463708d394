//! Event translator: native runtime events -> gateway wire frames for one turn.
//!
//! Frames come out in the order events arrive. Repeated identical text snapshots are suppressed,
//! each command/tool item is announced once, and nothing is emitted after the turn ends.

use crate::agent::{ItemDetails, NativeEvent, ThreadItem};
use crate::gateway::protocol::{ActionKind, ActionStatus, ServerFrame, TextStatus};
use std::collections::HashSet;

/// Commands longer than this (or spanning lines) are shown as a generic label.
pub const MAX_COMMAND_SUMMARY: usize = 80;

const GENERIC_COMMAND_LABEL: &str = "shell command";

/// Output of one translated event.
#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    /// The runtime started a thread; bind it before processing anything else. Not sent to the client.
    BindThread(String),
    Frame(ServerFrame),
}

/// Per-turn translation state (the connection's accumulated text and action trace).
#[derive(Debug, Default)]
pub struct EventTranslator {
    last_text: Option<(String, TextStatus)>,
    final_text: String,
    action_trace: Vec<String>,
    announced: HashSet<String>,
    finished: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest completed agent message text (or the latest streamed snapshot if none completed).
    pub fn final_text(&self) -> &str {
        &self.final_text
    }

    /// Action summaries in the order they were announced.
    pub fn action_trace(&self) -> &[String] {
        &self.action_trace
    }

    /// True once a `turn.completed` or `error` frame has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn translate(&mut self, event: NativeEvent) -> Vec<Translated> {
        if self.finished {
            log::debug!("ignoring event after end of turn: {:?}", event);
            return Vec::new();
        }
        match event {
            NativeEvent::ThreadStarted { thread_id } => vec![Translated::BindThread(thread_id)],
            NativeEvent::TurnStarted => Vec::new(),
            NativeEvent::ItemStarted { item } | NativeEvent::ItemUpdated { item } => {
                self.item(item, TextStatus::Streaming)
            }
            NativeEvent::ItemCompleted { item } => self.item(item, TextStatus::Done),
            NativeEvent::TurnCompleted { usage } => {
                self.finished = true;
                vec![Translated::Frame(ServerFrame::TurnCompleted {
                    text: self.final_text.clone(),
                    usage: usage.map(Into::into),
                })]
            }
            NativeEvent::TurnFailed { error } => self.fail(error.message),
            NativeEvent::Error { message } => self.fail(message),
        }
    }

    fn fail(&mut self, message: String) -> Vec<Translated> {
        self.finished = true;
        let message = if message.trim().is_empty() {
            "agent turn failed".to_string()
        } else {
            message
        };
        vec![Translated::Frame(ServerFrame::error(message))]
    }

    fn item(&mut self, item: ThreadItem, status: TextStatus) -> Vec<Translated> {
        match item.details {
            ItemDetails::AgentMessage { text } => self.text(text, status),
            ItemDetails::CommandExecution { command } => {
                let summary = summarize_command(&command);
                self.action(item.id, ActionKind::Command, summary)
            }
            ItemDetails::McpToolCall { server, tool } => {
                let label = if server.is_empty() {
                    tool
                } else {
                    format!("{}.{}", server, tool)
                };
                self.action(item.id, ActionKind::ToolCall, label)
            }
            ItemDetails::Reasoning { .. } | ItemDetails::Other => Vec::new(),
        }
    }

    fn text(&mut self, text: String, status: TextStatus) -> Vec<Translated> {
        if status == TextStatus::Streaming && text.is_empty() {
            return Vec::new();
        }
        let unchanged = match &self.last_text {
            Some((last, last_status)) => {
                *last == text && (status == TextStatus::Streaming || *last_status == status)
            }
            None => false,
        };
        self.final_text = text.clone();
        if unchanged {
            return Vec::new();
        }
        self.last_text = Some((text.clone(), status));
        vec![Translated::Frame(ServerFrame::AgentText { text, status })]
    }

    fn action(&mut self, item_id: String, kind: ActionKind, label: String) -> Vec<Translated> {
        if !self.announced.insert(item_id) {
            return Vec::new();
        }
        self.action_trace.push(label.clone());
        let (command, tool) = match kind {
            ActionKind::Command => (Some(label), None),
            ActionKind::ToolCall => (None, Some(label)),
        };
        vec![Translated::Frame(ServerFrame::AgentAction {
            action: kind,
            command,
            tool,
            status: ActionStatus::Started,
        })]
    }
}

/// Short human-readable form of a shell command: drops a `bash -lc`/`sh -c` wrapper and
/// surrounding quotes; long or multi-line commands collapse to a generic label.
pub fn summarize_command(command: &str) -> String {
    let mut cmd = command.trim();
    for wrapper in ["bash -lc ", "bash -c ", "sh -lc ", "sh -c ", "/bin/bash -lc ", "/bin/sh -c "] {
        if let Some(rest) = cmd.strip_prefix(wrapper) {
            cmd = rest.trim();
            break;
        }
    }
    for quote in ['\'', '"'] {
        if cmd.len() >= 2 && cmd.starts_with(quote) && cmd.ends_with(quote) {
            cmd = &cmd[1..cmd.len() - 1];
            break;
        }
    }
    let cmd = cmd.trim();
    if cmd.is_empty() || cmd.contains('\n') || cmd.chars().count() > MAX_COMMAND_SUMMARY {
        GENERIC_COMMAND_LABEL.to_string()
    } else {
        cmd.to_string()
    }
}
