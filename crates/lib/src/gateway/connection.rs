//! Connection handler: one task per WebSocket, one spawned task per turn.
//!
//! Frames for a connection go through a bounded queue drained by a writer task; when the queue is
//! full the frame is dropped. At most one turn is in flight per connection; a second `chat` while
//! busy gets an `error` frame. Closing the socket aborts the turn task, which drops the event stream.

use crate::agent::AgentError;
use crate::confirm::{confirmed_id_from_message, decode_reply, ConfirmPayload, StructuredReply};
use crate::gateway::protocol::{parse_client_frame, ChatParams, ClientFrame, ResetParams, ServerFrame};
use crate::gateway::server::GatewayState;
use crate::persistence::{default_title, RequestContext};
use crate::prompt::{compose_prompt, PromptContext};
use crate::session::{new_session_id, ChatMessage, MessageKind, Role, SessionId, TurnGuard, TurnTicket};
use crate::translate::{EventTranslator, Translated};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

pub(crate) const BUSY_MESSAGE: &str = "busy: a turn is already in progress";
pub(crate) const MESSAGE_REQUIRED: &str = "Message is required";
pub(crate) const RUNTIME_UNAVAILABLE: &str = "agent runtime unavailable";

/// Sending half of the per-connection outbound queue.
#[derive(Clone)]
struct Outbound(mpsc::Sender<ServerFrame>);

impl Outbound {
    /// Queue a frame without waiting. Returns false once the connection is gone.
    fn send(&self, frame: ServerFrame) -> bool {
        match self.0.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                log::debug!("outbound queue full, dropping frame {:?}", frame);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Set while a turn runs on the connection. Cleared just before the turn's terminal frame is queued,
/// so a client reacting to `turn.completed` is never told it is busy. Dropping it (abort) clears it too.
struct BusyFlag {
    flag: Arc<AtomicBool>,
    held: bool,
}

impl BusyFlag {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: flag.clone(),
                held: true,
            })
    }

    /// Idempotent; after the first call the flag may belong to the next turn.
    fn release(&mut self) {
        if self.held {
            self.held = false;
            self.flag.store(false, Ordering::Release);
        }
    }
}

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything a turn needs, captured from the `chat` frame.
struct TurnRequest {
    session_id: SessionId,
    message: String,
    confirmed_action_id: Option<String>,
    org_id: Option<String>,
    title: Option<String>,
}

struct Connection {
    state: GatewayState,
    ctx: RequestContext,
    out: Outbound,
    busy: Arc<AtomicBool>,
    turn: Option<JoinHandle<()>>,
}

pub(crate) async fn handle_socket(socket: WebSocket, state: GatewayState, ctx: RequestContext) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(state.config.gateway.outbound_buffer.max(1));

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("serializing frame failed: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let mut conn = Connection {
        state,
        ctx,
        out: Outbound(out_tx),
        busy: Arc::new(AtomicBool::new(false)),
        turn: None,
    };
    log::debug!("ws connection opened");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => conn.on_message(&text).await,
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
        }
    }

    conn.on_close();
}

impl Connection {
    async fn on_message(&mut self, text: &str) {
        match parse_client_frame(text) {
            Ok(ClientFrame::Chat(params)) => self.on_chat(params).await,
            Ok(ClientFrame::Reset(params)) => self.on_reset(params).await,
            Err(e) => {
                log::debug!("rejected frame: {}", e);
                self.out.send(ServerFrame::error(e.to_string()));
            }
        }
    }

    async fn on_chat(&mut self, params: ChatParams) {
        let message = params.message.trim();
        if message.is_empty() {
            self.out.send(ServerFrame::error(MESSAGE_REQUIRED));
            return;
        }
        let Some(busy) = BusyFlag::acquire(&self.busy) else {
            self.out.send(ServerFrame::error(BUSY_MESSAGE));
            return;
        };
        let session_id = params
            .session_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(new_session_id);
        // Taken before any later frame on this connection (such as a reset) is handled.
        let ticket = self.state.registry.turn_ticket(&session_id).await;

        self.out.send(ServerFrame::SessionId {
            session_id: session_id.clone(),
        });
        self.out.send(ServerFrame::TurnStarted);

        let req = TurnRequest {
            session_id,
            message: message.to_string(),
            confirmed_action_id: params
                .confirmed_action_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            org_id: params.org_id,
            title: params.title,
        };
        self.turn = Some(tokio::spawn(run_turn(
            self.state.clone(),
            self.ctx.clone(),
            self.out.clone(),
            busy,
            ticket,
            req,
        )));
    }

    async fn on_reset(&mut self, params: ResetParams) {
        if let Some(id) = params.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if self.state.registry.evict(id).await {
                log::info!("session {} reset", id);
            }
            self.state.ledger.forget_session(id).await;
        }
        self.out.send(ServerFrame::SessionReset);
    }

    fn on_close(&mut self) {
        if let Some(turn) = self.turn.take() {
            if !turn.is_finished() {
                log::debug!("connection closed mid-turn, aborting stream");
            }
            turn.abort();
        }
        log::debug!("ws connection closed");
    }
}

async fn run_turn(
    state: GatewayState,
    ctx: RequestContext,
    out: Outbound,
    mut busy: BusyFlag,
    ticket: TurnTicket,
    req: TurnRequest,
) {
    let turn = ticket.lock().await;
    let sid = req.session_id.as_str();
    // Every path ends the turn with exactly one terminal frame sent through `finish`.
    let mut finish = |frame: ServerFrame| {
        busy.release();
        out.send(frame)
    };

    let confirmed_id = match confirmation_id(&req) {
        Ok(id) => id,
        Err(message) => {
            finish(ServerFrame::error(message));
            return;
        }
    };
    let confirmed: Option<ConfirmPayload> = match confirmed_id.as_deref() {
        None => None,
        Some(id) => match state.ledger.consume(sid, id).await {
            Ok(payload) => Some(payload),
            Err(e) if state.config.gateway.strict_confirmations => {
                log::warn!("session {}: rejected confirmation: {}", sid, e);
                finish(ServerFrame::error(e.to_string()));
                return;
            }
            Err(e) => {
                log::debug!("session {}: unverified confirmation forwarded: {}", sid, e);
                None
            }
        },
    };

    let thread = match state.registry.resolve(sid).await {
        Some(thread_ref) => {
            log::debug!("session {} resuming thread {}", sid, thread_ref);
            state.adapter.resume_thread(thread_ref)
        }
        None => {
            log::debug!("session {} starting new thread", sid);
            state.adapter.start_thread()
        }
    };

    let org_id = req.org_id.as_deref().or(ctx.org_id.as_deref());
    let prompt = compose_prompt(&PromptContext {
        skills_summary: &state.skills_summary,
        org_id,
        confirmed_action_id: confirmed_id.as_deref(),
        confirmed_action: confirmed.as_ref(),
        message: &req.message,
    });

    let mut events = match thread.run_streamed(&prompt).await {
        Ok(events) => events,
        Err(e) => {
            log::warn!("session {}: {}", sid, e);
            record_failure(&state, &req, &turn, RUNTIME_UNAVAILABLE).await;
            finish(ServerFrame::error(RUNTIME_UNAVAILABLE));
            return;
        }
    };

    let idle = state.config.agent.idle_timeout();
    let mut translator = EventTranslator::new();
    let mut completion: Option<ServerFrame> = None;
    let mut failure: Option<String> = None;
    while !translator.is_finished() {
        let event = match tokio::time::timeout(idle, events.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                failure = Some("agent stream ended before the turn completed".to_string());
                break;
            }
            Err(_) => {
                failure = Some(AgentError::IdleTimeout(idle).to_string());
                break;
            }
        };
        for item in translator.translate(event) {
            match item {
                Translated::BindThread(thread_ref) => {
                    if !state.registry.bind_for_turn(sid, &thread_ref, &turn).await {
                        log::debug!("session {} was reset mid-turn, not binding {}", sid, thread_ref);
                    }
                }
                // Held back until the transcript and ledger are updated.
                Translated::Frame(frame @ ServerFrame::TurnCompleted { .. }) => completion = Some(frame),
                Translated::Frame(ServerFrame::Error { message }) => failure = Some(message),
                Translated::Frame(frame) => {
                    if !out.send(frame) {
                        log::debug!("session {}: connection gone, stopping turn", sid);
                        return;
                    }
                }
            }
        }
    }
    drop(events);

    let Some(completion) = completion else {
        let message = failure.unwrap_or_else(|| "agent turn failed".to_string());
        log::warn!("session {}: {}", sid, message);
        record_failure(&state, &req, &turn, &message).await;
        finish(ServerFrame::error(message));
        return;
    };

    let reply = decode_reply(translator.final_text());
    let mut assistant = ChatMessage::new(Role::Assistant, MessageKind::Message, reply.text());
    assistant.action_trace = translator.action_trace().to_vec();
    if let StructuredReply::Confirm(payload) = reply {
        state.ledger.record(sid, payload.clone()).await;
        if state.registry.is_current(sid, &turn).await {
            log::info!("session {}: action {} proposed", sid, payload.action_id);
        } else {
            // Reset raced the recording; nothing may stay issued for the old session.
            state.ledger.forget_session(sid).await;
        }
        assistant.kind = MessageKind::Confirm;
        assistant.confirm_payload = Some(payload);
    }

    let snapshot = state
        .registry
        .append_for_turn(
            sid,
            req.title.as_deref(),
            vec![ChatMessage::user(&req.message), assistant],
            &turn,
        )
        .await;
    finish(completion);
    if let Some(snapshot) = snapshot {
        persist(&state, ctx, snapshot, turn);
    }
}

/// Confirmed id from the frame field or a `CONFIRM_ACTION: <id>` message; both must agree when present.
fn confirmation_id(req: &TurnRequest) -> Result<Option<String>, String> {
    let from_message = confirmed_id_from_message(&req.message);
    match (req.confirmed_action_id.clone(), from_message) {
        (Some(field), Some(msg)) if field != msg => Err(format!(
            "confirmation mismatch: confirmedActionId {} does not match message id {}",
            field, msg
        )),
        (Some(field), _) => Ok(Some(field)),
        (None, msg) => Ok(msg),
    }
}

async fn record_failure(state: &GatewayState, req: &TurnRequest, turn: &TurnGuard, message: &str) {
    let error = ChatMessage::new(Role::Assistant, MessageKind::Error, message);
    state
        .registry
        .append_for_turn(
            &req.session_id,
            req.title.as_deref(),
            vec![ChatMessage::user(&req.message), error],
            turn,
        )
        .await;
}

/// Save the transcript on a detached task. The turn lock moves into the task so the next turn on
/// this session sees the conversation id created here.
fn persist(
    state: &GatewayState,
    ctx: RequestContext,
    snapshot: crate::session::Session,
    turn: TurnGuard,
) {
    let Some(store) = state.conversations.clone() else {
        return;
    };
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let _turn = turn;
        let title = snapshot
            .title
            .clone()
            .unwrap_or_else(|| default_title(&snapshot.messages));
        match store
            .save(&ctx, snapshot.conversation_id.as_deref(), &title, &snapshot.messages)
            .await
        {
            Ok(record) => {
                if snapshot.conversation_id.as_deref() != Some(record.id.as_str()) {
                    registry.set_conversation_id(&snapshot.session_id, &record.id).await;
                }
                log::debug!("session {} saved as conversation {}", snapshot.session_id, record.id);
            }
            Err(e) => log::warn!(
                "saving conversation for session {} failed: {}",
                snapshot.session_id,
                e
            ),
        }
    });
}
