//! Native event vocabulary of the external agent runtime (one JSON object per stdout line).

use serde::Deserialize;

/// One event of a streamed turn, in arrival order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum NativeEvent {
    /// Carries the thread reference to persist before anything else is processed.
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: ThreadError },
    #[serde(rename = "error")]
    Error { message: String },
}

impl NativeEvent {
    /// True for events that end the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NativeEvent::TurnCompleted { .. } | NativeEvent::TurnFailed { .. } | NativeEvent::Error { .. }
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        NativeEvent::TurnFailed {
            error: ThreadError {
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadItem {
    pub id: String,
    #[serde(flatten)]
    pub details: ItemDetails,
}

/// Item payloads the gateway cares about; everything else collapses into `Other`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemDetails {
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    CommandExecution {
        #[serde(default)]
        command: String,
    },
    McpToolCall {
        #[serde(default)]
        server: String,
        #[serde(default)]
        tool: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadError {
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Parse one stdout line into an event.
pub fn parse_event_line(line: &str) -> Result<NativeEvent, serde_json::Error> {
    serde_json::from_str(line.trim())
}
