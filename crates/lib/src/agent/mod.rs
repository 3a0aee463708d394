//! Agent adapter: the narrow streaming interface to the external autonomous-agent runtime.
//!
//! [`AgentRuntime`] is the seam; [`CodexRuntime`] spawns the codex CLI, tests plug in scripted runtimes.

mod codex;
mod events;
mod runtime;

pub use codex::CodexRuntime;
pub use events::{parse_event_line, ItemDetails, NativeEvent, ThreadError, ThreadItem, Usage};
pub use runtime::{AgentAdapter, AgentError, AgentRuntime, EventStream, Thread, ThreadOptions};
