//! Reconnecting WebSocket client loop. Commands in, [`ClientUpdate`]s out.
//! On close or error the loop waits a fixed delay and reconnects, indefinitely, keeping the session id.

use super::state::{ClientError, ClientState, ClientUpdate};
use super::store;
use crate::gateway::protocol::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Chat(String),
    Approve,
    Cancel,
    Reset,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// e.g. `ws://127.0.0.1:8765/ws`
    pub url: String,
    pub gateway_token: Option<String>,
    /// Sent as `Authorization: Bearer` for conversation persistence.
    pub bearer_token: Option<String>,
    pub org_id: Option<String>,
    /// Where the session id is stored between runs. None keeps it in memory only.
    pub session_path: Option<PathBuf>,
    pub reconnect_delay: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            gateway_token: None,
            bearer_token: None,
            org_id: None,
            session_path: None,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Flow {
    Reconnect,
    Exit,
}

/// Run until the command channel closes or the update receiver is dropped.
pub async fn run_client(
    options: ClientOptions,
    session_id: Option<String>,
    mut commands: mpsc::Receiver<ClientCommand>,
    updates: mpsc::Sender<ClientUpdate>,
) -> Result<(), ClientError> {
    let session_id = session_id.or_else(|| options.session_path.as_deref().and_then(store::load_session_id));
    let mut state = ClientState::new(session_id);

    loop {
        state.on_connecting();
        if updates.send(ClientUpdate::Status(state.status())).await.is_err() {
            return Ok(());
        }
        match tokio_tungstenite::connect_async(build_request(&options)?).await {
            Ok((ws, _)) => {
                log::info!("connected to {}", options.url);
                state.on_open();
                if updates.send(ClientUpdate::Status(state.status())).await.is_err() {
                    return Ok(());
                }
                if let Flow::Exit = drive(&mut state, ws, &options, &mut commands, &updates).await {
                    return Ok(());
                }
            }
            Err(e) => log::debug!("connecting to {} failed: {}", options.url, e),
        }

        state.on_disconnect();
        if updates.send(ClientUpdate::Status(state.status())).await.is_err() {
            return Ok(());
        }
        log::debug!("reconnecting in {}s", options.reconnect_delay.as_secs());

        let delay = tokio::time::sleep(options.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    let update = match cmd {
                        ClientCommand::Cancel => state.cancel().unwrap_or_else(|e| ClientUpdate::Error(e.to_string())),
                        _ => ClientUpdate::Error(ClientError::NotReady(state.status()).to_string()),
                    };
                    if updates.send(update).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn build_request(options: &ClientOptions) -> Result<Request<()>, ClientError> {
    let mut request = options.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    if let Some(ref token) = options.gateway_token {
        headers.insert("x-gateway-token", header_value(token)?);
    }
    if let Some(ref token) = options.bearer_token {
        headers.insert("authorization", header_value(&format!("Bearer {}", token))?);
    }
    if let Some(ref org) = options.org_id {
        headers.insert("x-org-id", header_value(org)?);
    }
    Ok(request)
}

fn header_value(s: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(s).map_err(|e| ClientError::Header(e.to_string()))
}

/// Frame to send and/or update to publish for one command.
fn handle_command(
    state: &mut ClientState,
    cmd: ClientCommand,
    options: &ClientOptions,
) -> Result<(Option<ClientFrame>, Option<ClientUpdate>), ClientError> {
    match cmd {
        ClientCommand::Chat(text) => Ok((Some(state.begin_chat(&text, None)?), None)),
        ClientCommand::Approve => Ok((Some(state.approve()?), None)),
        ClientCommand::Cancel => Ok((None, Some(state.cancel()?))),
        ClientCommand::Reset => {
            let frame = state.reset()?;
            if let Some(ref path) = options.session_path {
                if let Err(e) = store::clear_session_id(path) {
                    log::warn!("clearing stored session id failed: {}", e);
                }
            }
            match frame {
                Some(frame) => Ok((Some(frame), None)),
                None => Ok((None, Some(ClientUpdate::Reset))),
            }
        }
    }
}

async fn drive(
    state: &mut ClientState,
    ws: Socket,
    options: &ClientOptions,
    commands: &mut mpsc::Receiver<ClientCommand>,
    updates: &mpsc::Sender<ClientUpdate>,
) -> Flow {
    let (mut sink, mut stream) = ws.split();
    loop {
        let before = state.status();
        let mut out: Vec<ClientUpdate> = Vec::new();
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    let _ = sink.close().await;
                    return Flow::Exit;
                };
                match handle_command(state, cmd, options) {
                    Ok((frame, update)) => {
                        out.extend(update);
                        if let Some(frame) = frame {
                            let text = match serde_json::to_string(&frame) {
                                Ok(t) => t,
                                Err(e) => {
                                    out.push(ClientUpdate::Error(ClientError::from(e).to_string()));
                                    String::new()
                                }
                            };
                            if !text.is_empty() {
                                if let Err(e) = sink.send(Message::Text(text)).await {
                                    log::debug!("send failed: {}", e);
                                    return Flow::Reconnect;
                                }
                            }
                        }
                    }
                    Err(e) => out.push(ClientUpdate::Error(e.to_string())),
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if let ServerFrame::SessionId { ref session_id } = frame {
                                if let Some(ref path) = options.session_path {
                                    if let Err(e) = store::save_session_id(path, session_id) {
                                        log::warn!("storing session id failed: {}", e);
                                    }
                                }
                            }
                            out.extend(state.apply(frame));
                        }
                        Err(e) => log::debug!("ignoring unrecognized frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed by gateway");
                        return Flow::Reconnect;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("connection error: {}", e);
                        return Flow::Reconnect;
                    }
                }
            }
        }
        if state.status() != before {
            out.push(ClientUpdate::Status(state.status()));
        }
        for update in out {
            if updates.send(update).await.is_err() {
                return Flow::Exit;
            }
        }
    }
}
