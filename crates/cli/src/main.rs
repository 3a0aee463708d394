use clap::{Parser, Subcommand};
use lib::client::{self, ClientCommand, ClientOptions, ClientUpdate, ConnectionStatus};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "plg-gateway")]
#[command(about = "PLG conversational agent gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config and skills root).
    Init {
        /// Config file path (default: PLG_GATEWAY_CONFIG_PATH or ~/.plg-gateway/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket). Spawns the codex runtime per turn.
    Gateway {
        /// Config file path (default: PLG_GATEWAY_CONFIG_PATH or ~/.plg-gateway/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 8765)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat through a running gateway (interactive). `/reset` starts over, `/exit` quits.
    Chat {
        /// Config file path (default: PLG_GATEWAY_CONFIG_PATH or ~/.plg-gateway/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Session id to continue (default: the last one stored in ~/.plg-gateway/client_session).
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// API bearer token forwarded for conversation persistence.
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,

        /// Active organization id.
        #[arg(long, value_name = "ORG")]
        org: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("plg-gateway {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            session,
            token,
            org,
        }) => {
            if let Err(e) = run_chat(config, session, token, org).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path).await
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    session: Option<String>,
    token: Option<String>,
    org: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let bind = config.gateway.bind.trim();
    let host = if bind == "0.0.0.0" || bind == "::" { "127.0.0.1" } else { bind };
    let mut options = ClientOptions::new(format!("ws://{}:{}/ws", host, config.gateway.port));
    options.gateway_token = lib::config::resolve_gateway_token(&config);
    options.bearer_token = token;
    options.org_id = org;
    options.session_path = Some(client::store::default_session_path());

    let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(16);
    let (upd_tx, mut upd_rx) = mpsc::channel::<ClientUpdate>(256);
    let client_task = tokio::spawn(client::run_client(options, session, cmd_rx, upd_tx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut view = ChatView::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                let cmd = if view.awaiting_confirm {
                    view.awaiting_confirm = false;
                    if input.eq_ignore_ascii_case("y") || input.eq_ignore_ascii_case("yes") {
                        ClientCommand::Approve
                    } else {
                        ClientCommand::Cancel
                    }
                } else if input.is_empty() {
                    continue;
                } else if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                } else if input.eq_ignore_ascii_case("/reset") {
                    ClientCommand::Reset
                } else {
                    ClientCommand::Chat(input.to_string())
                };
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            update = upd_rx.recv() => {
                let Some(update) = update else { break };
                view.render(update)?;
            }
        }
    }

    drop(cmd_tx);
    match client_task.await {
        Ok(res) => res.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::anyhow!("chat client task failed: {}", e)),
    }
}

/// Terminal rendering of client updates.
#[derive(Default)]
struct ChatView {
    /// Streamed text already printed for the current reply.
    streamed: String,
    awaiting_confirm: bool,
    last_status: Option<ConnectionStatus>,
}

impl ChatView {
    fn render(&mut self, update: ClientUpdate) -> std::io::Result<()> {
        let mut out = std::io::stdout();
        match update {
            ClientUpdate::Status(status) => {
                if self.last_status == Some(status) {
                    return Ok(());
                }
                self.last_status = Some(status);
                match status {
                    ConnectionStatus::Ready => {
                        self.finish_stream(&mut out)?;
                        writeln!(out, "(connected)")?;
                    }
                    ConnectionStatus::Error => {
                        self.finish_stream(&mut out)?;
                        writeln!(
                            out,
                            "(disconnected, retrying in {}s)",
                            client::RECONNECT_DELAY.as_secs()
                        )?;
                    }
                    ConnectionStatus::Connecting | ConnectionStatus::Processing => {}
                }
            }
            ClientUpdate::Session(id) => log::debug!("session {}", id),
            ClientUpdate::Action(label) => {
                self.finish_stream(&mut out)?;
                writeln!(out, "  [step] {}", label)?;
            }
            ClientUpdate::Text { text, .. } => {
                // Structured replies are printed once decoded.
                if text.trim_start().starts_with('{') {
                    return Ok(());
                }
                match text.strip_prefix(self.streamed.as_str()) {
                    Some(delta) if !self.streamed.is_empty() => write!(out, "{}", delta)?,
                    _ => {
                        self.finish_stream(&mut out)?;
                        write!(out, "< {}", text)?;
                    }
                }
                self.streamed = text;
                out.flush()?;
            }
            ClientUpdate::Reply(text) => {
                if !self.streamed.is_empty() && self.streamed.trim() == text.trim() {
                    self.streamed.clear();
                    writeln!(out)?;
                } else {
                    self.finish_stream(&mut out)?;
                    writeln!(out, "< {}", text.trim())?;
                }
            }
            ClientUpdate::Confirm(payload) => {
                self.finish_stream(&mut out)?;
                writeln!(out, "< confirmation required: {}", payload.label())?;
                if let Some(ref summary) = payload.summary {
                    writeln!(out, "  {}", summary)?;
                }
                if let (Some(method), Some(target)) = (&payload.method, &payload.target) {
                    writeln!(out, "  {} {}", method, target)?;
                }
                if let Some(ref body) = payload.body {
                    writeln!(out, "  body: {}", body)?;
                }
                write!(out, "Approve? [y/N] ")?;
                out.flush()?;
                self.awaiting_confirm = true;
            }
            ClientUpdate::Canceled(payload) => writeln!(out, "canceled: {}", payload.label())?,
            ClientUpdate::Error(message) => {
                self.finish_stream(&mut out)?;
                eprintln!("error: {}", message);
            }
            ClientUpdate::Reset => {
                self.awaiting_confirm = false;
                writeln!(out, "(session reset)")?;
            }
        }
        Ok(())
    }

    fn finish_stream(&mut self, out: &mut std::io::Stdout) -> std::io::Result<()> {
        if !self.streamed.is_empty() {
            self.streamed.clear();
            writeln!(out)?;
        }
        Ok(())
    }
}
