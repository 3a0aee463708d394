//! Codex CLI runtime: one `codex exec --experimental-json` process per turn.
//! The prompt goes to stdin; stdout is JSONL events. The child is killed when the stream is dropped.

use super::events::{parse_event_line, NativeEvent};
use super::runtime::{AgentError, AgentRuntime, EventStream, ThreadOptions};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

/// Runtime backed by the codex binary.
#[derive(Debug, Clone)]
pub struct CodexRuntime {
    codex_path: PathBuf,
}

impl CodexRuntime {
    pub fn new(codex_path: impl Into<PathBuf>) -> Self {
        Self {
            codex_path: codex_path.into(),
        }
    }

    /// Arguments for one turn; `resume <thread>` comes last.
    pub fn command_args(thread_ref: Option<&str>, options: &ThreadOptions) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--experimental-json".to_string()];
        if let Some(ref model) = options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref sandbox) = options.sandbox_mode {
            args.push("--sandbox".to_string());
            args.push(sandbox.clone());
        }
        if let Some(ref dir) = options.working_directory {
            args.push("--cd".to_string());
            args.push(dir.display().to_string());
        }
        if options.skip_git_repo_check {
            args.push("--skip-git-repo-check".to_string());
        }
        if let Some(ref policy) = options.approval_policy {
            args.push("--config".to_string());
            args.push(format!("approval_policy=\"{}\"", policy));
        }
        args.extend(options.extra_args.iter().cloned());
        if let Some(thread) = thread_ref {
            args.push("resume".to_string());
            args.push(thread.to_string());
        }
        args
    }
}

#[async_trait]
impl AgentRuntime for CodexRuntime {
    async fn run_streamed(
        &self,
        thread_ref: Option<&str>,
        options: &ThreadOptions,
        prompt: &str,
    ) -> Result<EventStream, AgentError> {
        let args = Self::command_args(thread_ref, options);
        log::debug!(
            "spawning {} exec (resume: {})",
            self.codex_path.display(),
            thread_ref.unwrap_or("-")
        );
        let mut child = Command::new(&self.codex_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                path: self.codex_path.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or(AgentError::Pipe("stdin"))?;
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let stdout = child.stdout.take().ok_or(AgentError::Pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("codex stderr: {}", line);
                }
            });
        }

        let state = ReadState {
            lines: BufReader::new(stdout).lines(),
            child,
            saw_terminal: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(Some(state), next_event)))
    }
}

struct ReadState {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    saw_terminal: bool,
}

async fn next_event(state: Option<ReadState>) -> Option<(NativeEvent, Option<ReadState>)> {
    let mut st = state?;
    loop {
        match st.lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_event_line(&line) {
                    Ok(event) => {
                        if event.is_terminal() {
                            st.saw_terminal = true;
                        }
                        return Some((event, Some(st)));
                    }
                    Err(e) => {
                        log::debug!("skipping unparsable codex line: {}", e);
                        continue;
                    }
                }
            }
            Ok(None) => {
                let status = st.child.wait().await;
                if st.saw_terminal {
                    return None;
                }
                let message = match status {
                    Ok(s) if s.success() => "agent runtime exited before completing the turn".to_string(),
                    Ok(s) => format!("agent runtime exited with {}", s),
                    Err(e) => format!("agent runtime wait failed: {}", e),
                };
                return Some((NativeEvent::failed(message), None));
            }
            Err(e) => {
                return Some((NativeEvent::failed(format!("reading agent output: {}", e)), None));
            }
        }
    }
}
