//! Agent adapter: start or resume a thread and stream one turn of native events.

use super::events::NativeEvent;
use crate::config::AgentConfig;
use async_trait::async_trait;
use futures_util::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Ordered, asynchronous sequence of native events for one turn.
pub type EventStream = Pin<Box<dyn Stream<Item = NativeEvent> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start agent runtime {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("agent runtime {0} unavailable")]
    Pipe(&'static str),
    #[error("agent runtime io: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent runtime produced no events for {}s", .0.as_secs())]
    IdleTimeout(Duration),
}

/// Opaque working-context options forwarded to the runtime unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadOptions {
    pub working_directory: Option<PathBuf>,
    pub model: Option<String>,
    pub sandbox_mode: Option<String>,
    pub approval_policy: Option<String>,
    pub skip_git_repo_check: bool,
    pub extra_args: Vec<String>,
}

impl From<&AgentConfig> for ThreadOptions {
    fn from(c: &AgentConfig) -> Self {
        Self {
            working_directory: c.working_directory.clone(),
            model: c.model.clone(),
            sandbox_mode: c.sandbox_mode.clone(),
            approval_policy: c.approval_policy.clone(),
            skip_git_repo_check: c.skip_git_repo_check,
            extra_args: c.extra_args.clone(),
        }
    }
}

/// The external runtime. `thread_ref` is None for a new thread; the stream then starts with `thread.started`.
/// Failures after the stream is returned surface as a terminal `turn.failed` event.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_streamed(
        &self,
        thread_ref: Option<&str>,
        options: &ThreadOptions,
        prompt: &str,
    ) -> Result<EventStream, AgentError>;
}

/// Opens threads against a runtime with fixed options.
#[derive(Clone)]
pub struct AgentAdapter {
    runtime: Arc<dyn AgentRuntime>,
    options: ThreadOptions,
}

impl AgentAdapter {
    pub fn new(runtime: Arc<dyn AgentRuntime>, options: ThreadOptions) -> Self {
        Self { runtime, options }
    }

    pub fn start_thread(&self) -> Thread {
        Thread {
            runtime: self.runtime.clone(),
            options: self.options.clone(),
            thread_ref: None,
        }
    }

    pub fn resume_thread(&self, thread_ref: impl Into<String>) -> Thread {
        Thread {
            runtime: self.runtime.clone(),
            options: self.options.clone(),
            thread_ref: Some(thread_ref.into()),
        }
    }
}

/// A thread handle. Starting is lazy: nothing runs until [`Thread::run_streamed`].
pub struct Thread {
    runtime: Arc<dyn AgentRuntime>,
    options: ThreadOptions,
    thread_ref: Option<String>,
}

impl Thread {
    /// Run one turn. No retries.
    pub async fn run_streamed(&self, prompt: &str) -> Result<EventStream, AgentError> {
        self.runtime
            .run_streamed(self.thread_ref.as_deref(), &self.options, prompt)
            .await
    }
}
