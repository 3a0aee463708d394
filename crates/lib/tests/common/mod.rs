//! Shared helpers for gateway integration tests: a scripted agent runtime, a server on a free
//! port, and WebSocket frame helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lib::agent::{
    AgentError, AgentRuntime, EventStream, ItemDetails, NativeEvent, ThreadItem, ThreadOptions, Usage,
};
use lib::config::Config;
use lib::gateway::{GatewayState, ServerFrame};
use lib::persistence::ConversationStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One `run_streamed` invocation seen by the scripted runtime.
#[derive(Debug, Clone)]
pub struct Call {
    pub thread_ref: Option<String>,
    pub prompt: String,
}

type Script = Box<dyn Fn(&str) -> Vec<NativeEvent> + Send + Sync>;

/// Runtime that answers every turn from a script keyed on the prompt. New threads get
/// `thread-<n>` and open with `thread.started`; resumed threads do not.
pub struct ScriptedRuntime {
    next_thread: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    script: Script,
    event_delay: Duration,
    unavailable: bool,
    /// Events handed to the gateway so far, across all turns.
    consumed: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new(script: impl Fn(&str) -> Vec<NativeEvent> + Send + Sync + 'static) -> Self {
        Self {
            next_thread: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
            event_delay: Duration::ZERO,
            unavailable: false,
            consumed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Every turn fails before a stream is returned.
    pub fn unavailable() -> Self {
        let mut rt = Self::new(|_| Vec::new());
        rt.unavailable = true;
        rt
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run_streamed(
        &self,
        thread_ref: Option<&str>,
        _options: &ThreadOptions,
        prompt: &str,
    ) -> Result<EventStream, AgentError> {
        self.calls.lock().unwrap().push(Call {
            thread_ref: thread_ref.map(str::to_string),
            prompt: prompt.to_string(),
        });
        if self.unavailable {
            return Err(AgentError::Pipe("stdin"));
        }
        let mut events = Vec::new();
        if thread_ref.is_none() {
            let n = self.next_thread.fetch_add(1, Ordering::SeqCst) + 1;
            events.push(NativeEvent::ThreadStarted {
                thread_id: format!("thread-{}", n),
            });
        }
        events.extend((self.script)(prompt));
        let delay = self.event_delay;
        let consumed = self.consumed.clone();
        Ok(Box::pin(futures_util::stream::iter(events).then(move |e| {
            let consumed = consumed.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                consumed.fetch_add(1, Ordering::SeqCst);
                e
            }
        })))
    }
}

pub fn agent_message(id: &str, text: &str) -> ThreadItem {
    ThreadItem {
        id: id.to_string(),
        details: ItemDetails::AgentMessage {
            text: text.to_string(),
        },
    }
}

pub fn command(id: &str, cmd: &str) -> ThreadItem {
    ThreadItem {
        id: id.to_string(),
        details: ItemDetails::CommandExecution {
            command: cmd.to_string(),
        },
    }
}

/// A turn that answers with `text` and completes.
pub fn reply(text: &str) -> Vec<NativeEvent> {
    vec![
        NativeEvent::TurnStarted,
        NativeEvent::ItemCompleted {
            item: agent_message("msg", text),
        },
        NativeEvent::TurnCompleted {
            usage: Some(Usage {
                input_tokens: 10,
                cached_input_tokens: 0,
                output_tokens: 5,
            }),
        },
    ]
}

/// The user message at the end of a composed prompt.
pub fn user_message(prompt: &str) -> &str {
    prompt.rsplit("User message:\n").next().unwrap_or("")
}

pub fn state_with(
    config: Config,
    runtime: Arc<ScriptedRuntime>,
    conversations: Option<Arc<dyn ConversationStore>>,
) -> GatewayState {
    GatewayState::new(
        config,
        runtime,
        "- projects: Read: GET /api/projects. Write: DELETE /api/projects/{id}. Manage projects".to_string(),
        conversations,
    )
}

/// Serve the gateway on a free loopback port; the task is left running when the test ends.
pub async fn start(state: GatewayState) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(lib::gateway::serve(listener, state));
    port
}

pub async fn connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    ws
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.expect("ws send");
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string())).await.expect("ws send");
}

pub async fn next_frame(ws: &mut Ws) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("server frame");
        }
    }
}

/// Frames up to and including the one that ends the turn (`turn.completed` or `error`).
pub async fn turn_frames(ws: &mut Ws) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(ws).await;
        let done = frame.ends_turn();
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

pub fn session_id_of(frames: &[ServerFrame]) -> String {
    frames
        .iter()
        .find_map(|f| match f {
            ServerFrame::SessionId { session_id } => Some(session_id.clone()),
            _ => None,
        })
        .expect("session.id frame")
}
