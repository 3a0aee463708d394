//! Gateway HTTP + WebSocket server (single port).

use crate::agent::{AgentAdapter, AgentRuntime, CodexRuntime, ThreadOptions};
use crate::config::{self, Config};
use crate::confirm::ActionLedger;
use crate::gateway::connection;
use crate::persistence::{ConversationStore, HttpConversationStore, RequestContext};
use crate::session::SessionRegistry;
use crate::skills::{load_skills, summarize_skills};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const GATEWAY_TOKEN_HEADER: &str = "x-gateway-token";
const ORG_HEADER: &str = "x-org-id";

/// When auth mode is token and a token is configured, returns it for upgrade validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway. Cloned into every connection; everything mutable is behind an `Arc`.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, the WebSocket upgrade must carry this token.
    pub required_token: Option<String>,
    pub registry: Arc<SessionRegistry>,
    pub ledger: Arc<ActionLedger>,
    pub adapter: AgentAdapter,
    /// Authorized capabilities, rendered once at startup for the prompt.
    pub skills_summary: Arc<str>,
    /// None when persistence is disabled.
    pub conversations: Option<Arc<dyn ConversationStore>>,
    /// Fires once on shutdown; connections close their sockets.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(
        config: Config,
        runtime: Arc<dyn AgentRuntime>,
        skills_summary: String,
        conversations: Option<Arc<dyn ConversationStore>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let options = ThreadOptions::from(&config.agent);
        Self {
            required_token: require_connect_token(&config),
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            ledger: Arc::new(ActionLedger::new()),
            adapter: AgentAdapter::new(runtime, options),
            skills_summary: skills_summary.into(),
            conversations,
            shutdown_tx,
        }
    }
}

/// HTTP routes: `/` status, `/health` check, `/ws` chat socket.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(status_http))
        .route("/health", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve on an already bound listener until the shutdown broadcast fires.
pub async fn serve(listener: TcpListener, state: GatewayState) -> Result<()> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("gateway server exited")
}

pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or PLG_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let skills_dir = config::resolve_skills_dir(&config, &config_path);
    let skills = match load_skills(
        Some(skills_dir.as_path()),
        &config.skills.extra_dirs,
        &config.skills.disabled,
    ) {
        Ok(skills) => skills,
        Err(e) => {
            log::warn!("loading skills failed: {}", e);
            Vec::new()
        }
    };
    log::info!("loaded {} skill(s) for the agent prompt", skills.len());

    let codex_path = config::resolve_codex_path(&config);
    log::info!("agent runtime: {}", codex_path.display());
    let runtime: Arc<dyn AgentRuntime> = Arc::new(CodexRuntime::new(codex_path));

    let conversations: Option<Arc<dyn ConversationStore>> = match config.persistence.api_base_url {
        Some(ref url) if !url.trim().is_empty() => {
            let store = HttpConversationStore::new(
                url,
                Duration::from_secs(config.persistence.timeout_secs),
            )
            .context("building persistence client")?;
            log::info!("conversation persistence enabled: {}", url.trim());
            Some(Arc::new(store))
        }
        _ => {
            log::info!("conversation persistence disabled (persistence.apiBaseUrl not set)");
            None
        }
    };

    let port = config.gateway.port;
    let state = GatewayState::new(config, runtime, summarize_skills(&skills), conversations);
    spawn_idle_sweeper(&state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    tokio::spawn(shutdown_signal(state.shutdown_tx.clone()));
    serve(listener, state).await?;
    log::info!("gateway stopped");
    Ok(())
}

/// Periodically evict idle sessions when `sessions.idleTtlSecs` is set.
fn spawn_idle_sweeper(state: &GatewayState) {
    let Some(ttl_secs) = state.config.sessions.idle_ttl_secs else {
        log::debug!("session idle eviction disabled");
        return;
    };
    let ttl = Duration::from_secs(ttl_secs);
    let every = Duration::from_secs(state.config.sessions.sweep_interval_secs.max(1));
    let registry = state.registry.clone();
    let ledger = state.ledger.clone();
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    log::info!("evicting sessions idle for more than {}s", ttl_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    for id in registry.evict_idle(ttl).await {
                        ledger.forget_session(&id).await;
                        log::info!("session {} evicted after idle timeout", id);
                    }
                }
            }
        }
    });
}

/// Waits for SIGINT or SIGTERM, then tells the server and every connection to stop.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing connections");
    let _ = shutdown_tx.send(());
}

/// GET /health for process supervisors.
async fn health_http() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// GET / returns name, version, and live session count.
async fn status_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "plg-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "sessions": state.registry.len().await,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    token: Option<String>,
    org_id: Option<String>,
    gateway_token: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Caller identity for persistence: `Authorization: Bearer` / `?token=`, `X-Org-Id` / `?orgId=`.
fn request_context(headers: &HeaderMap, query: &WsQuery) -> RequestContext {
    let bearer = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .or(query.token.as_deref())
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let org_id = header_str(headers, ORG_HEADER)
        .or(query.org_id.as_deref())
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string);
    RequestContext {
        bearer_token: bearer,
        org_id,
    }
}

/// GET /ws upgrades to WebSocket after the optional gateway token check.
async fn ws_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(ref required) = state.required_token {
        let provided = header_str(&headers, GATEWAY_TOKEN_HEADER)
            .or(query.gateway_token.as_deref())
            .unwrap_or("")
            .trim();
        if provided.is_empty() {
            return (
                StatusCode::UNAUTHORIZED,
                "unauthorized: gateway token missing (set PLG_GATEWAY_TOKEN or gateway.auth.token)",
            )
                .into_response();
        }
        if provided != required {
            return (StatusCode::UNAUTHORIZED, "unauthorized: gateway token mismatch").into_response();
        }
    }
    let ctx = request_context(&headers, &query);
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn request_context_prefers_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(ORG_HEADER, HeaderValue::from_static("org-1"));
        let query = WsQuery {
            token: Some("q".to_string()),
            org_id: Some("org-q".to_string()),
            gateway_token: None,
        };
        assert_eq!(
            request_context(&headers, &query),
            RequestContext {
                bearer_token: Some("abc".to_string()),
                org_id: Some("org-1".to_string()),
            }
        );
    }

    #[test]
    fn request_context_falls_back_to_query() {
        let query = WsQuery {
            token: Some("q".to_string()),
            org_id: Some("org-q".to_string()),
            gateway_token: None,
        };
        assert_eq!(
            request_context(&HeaderMap::new(), &query),
            RequestContext {
                bearer_token: Some("q".to_string()),
                org_id: Some("org-q".to_string()),
            }
        );
        assert_eq!(
            request_context(&HeaderMap::new(), &WsQuery::default()),
            RequestContext::default()
        );
    }

    #[test]
    fn token_required_only_in_token_mode() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("secret".to_string());
        assert_eq!(require_connect_token(&config), None);
        config.gateway.auth.mode = config::GatewayAuthMode::Token;
        if std::env::var("PLG_GATEWAY_TOKEN").is_err() {
            assert_eq!(require_connect_token(&config), Some("secret".to_string()));
        }
    }
}
