//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.plg-gateway/config.json`) and environment.
//! Agent settings are opaque to the gateway and forwarded to the runtime unchanged.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// External agent runtime settings (codex binary, sandbox, model).
    #[serde(default)]
    pub agent: AgentConfig,

    /// Skills load paths.
    #[serde(default)]
    pub skills: SkillsConfig,

    /// Session registry lifecycle.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Conversation persistence API.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8765).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,

    /// When true, a confirmed action id must have been issued for the session and not yet consumed.
    #[serde(default = "default_true")]
    pub strict_confirmations: bool,

    /// Frames queued per connection before new frames are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require the gateway token on upgrade.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket upgrade. Overridden by PLG_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require `X-Gateway-Token` (or `?gatewayToken=`) to match the configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    8765
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
            strict_confirmations: true,
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Settings for the external agent runtime. Passed through to thread creation as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Path or name of the codex binary. Overridden by PLG_CODEX_PATH env.
    #[serde(default)]
    pub codex_path: Option<PathBuf>,
    /// Working directory the runtime operates in.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    pub model: Option<String>,
    /// e.g. "read-only", "workspace-write".
    pub sandbox_mode: Option<String>,
    /// e.g. "never", "on-request".
    pub approval_policy: Option<String>,
    #[serde(default = "default_true")]
    pub skip_git_repo_check: bool,
    /// Abort a turn when the runtime emits nothing for this long.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Extra arguments appended after the generated ones.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_idle_timeout_secs() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            codex_path: None,
            working_directory: None,
            model: None,
            sandbox_mode: None,
            approval_policy: None,
            skip_git_repo_check: true,
            idle_timeout_secs: default_idle_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

/// Skills load config (dirs, disabled list).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    /// Override the default skill root. Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Extra skill directories (later ones override earlier ones by name).
    #[serde(default)]
    pub extra_dirs: Vec<PathBuf>,
    /// Skill names to skip even when present on disk.
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Session registry lifecycle. No TTL means sessions live until reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: None,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Conversation persistence. Disabled when `api_base_url` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    pub api_base_url: Option<String>,
    #[serde(default = "default_persistence_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_persistence_timeout_secs() -> u64 {
    10
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            timeout_secs: default_persistence_timeout_secs(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env PLG_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("PLG_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the codex binary: env PLG_CODEX_PATH, then config, then `codex` on PATH.
pub fn resolve_codex_path(config: &Config) -> PathBuf {
    non_empty_env("PLG_CODEX_PATH")
        .map(PathBuf::from)
        .or_else(|| config.agent.codex_path.clone())
        .unwrap_or_else(|| PathBuf::from("codex"))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Base directory for config and client state (`~/.plg-gateway`).
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".plg-gateway"))
        .unwrap_or_else(|| PathBuf::from(".plg-gateway"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PLG_GATEWAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_dir().join("config.json"))
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Default skill root when no override is set: `skills` subdirectory of the config file's parent.
pub fn skills_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("skills")
}

/// Resolve the primary skill root: `config.skills.directory` if set (relative to the config file's parent), otherwise the default.
pub fn resolve_skills_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.skills.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => skills_dir(config_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 8765);
        assert_eq!(g.bind, "127.0.0.1");
        assert!(g.strict_confirmations);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.gateway.port, 8765);
        assert_eq!(config.agent.idle_timeout_secs, 300);
        assert!(config.agent.skip_git_repo_check);
        assert!(config.sessions.idle_ttl_secs.is_none());
        assert!(config.persistence.api_base_url.is_none());
    }

    #[test]
    fn camel_case_keys_are_read() {
        let config: Config = serde_json::from_str(
            r#"{
                "gateway": { "strictConfirmations": false, "outboundBuffer": 8 },
                "agent": { "sandboxMode": "read-only", "idleTimeoutSecs": 12 },
                "sessions": { "idleTtlSecs": 3600 },
                "persistence": { "apiBaseUrl": "http://localhost:8000" }
            }"#,
        )
        .unwrap();
        assert!(!config.gateway.strict_confirmations);
        assert_eq!(config.gateway.outbound_buffer, 8);
        assert_eq!(config.agent.sandbox_mode.as_deref(), Some("read-only"));
        assert_eq!(config.agent.idle_timeout(), Duration::from_secs(12));
        assert_eq!(config.sessions.idle_ttl_secs, Some(3600));
        assert_eq!(
            config.persistence.api_base_url.as_deref(),
            Some("http://localhost:8000")
        );
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn resolve_skills_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.plg-gateway/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/home/user/.plg-gateway/skills")
        );
    }

    #[test]
    fn resolve_skills_dir_override_relative() {
        let mut config = Config::default();
        config.skills.directory = Some(PathBuf::from(".agents/skills"));
        let path = Path::new("/srv/app/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/srv/app/.agents/skills")
        );
    }

    #[test]
    fn resolve_skills_dir_override_absolute() {
        let mut config = Config::default();
        config.skills.directory = Some(PathBuf::from("/repo/.agents/skills"));
        let path = Path::new("/home/user/.plg-gateway/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/repo/.agents/skills")
        );
    }
}
