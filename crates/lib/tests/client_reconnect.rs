//! The reconnecting client against a live gateway: confirm flow and stored-session resume.

mod common;

use common::*;
use lib::agent::NativeEvent;
use lib::client::{run_client, ClientCommand, ClientOptions, ClientUpdate, ConnectionStatus};
use lib::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn script(prompt: &str) -> Vec<NativeEvent> {
    match user_message(prompt) {
        "delete project P" => reply(
            r#"Sure. {"type":"confirm","id":"a1","title":"Delete project P","method":"DELETE","path":"/api/projects/P"}"#,
        ),
        m if m.starts_with("CONFIRM_ACTION: a1") => reply(r#"{"type":"message","text":"Deleted project P."}"#),
        other => reply(&format!("echo: {}", other)),
    }
}

struct Client {
    commands: mpsc::Sender<ClientCommand>,
    updates: mpsc::Receiver<ClientUpdate>,
    task: tokio::task::JoinHandle<Result<(), lib::client::ClientError>>,
}

impl Client {
    fn spawn(options: ClientOptions) -> Self {
        let (commands, cmd_rx) = mpsc::channel(8);
        let (upd_tx, updates) = mpsc::channel(64);
        let task = tokio::spawn(run_client(options, None, cmd_rx, upd_tx));
        Self {
            commands,
            updates,
            task,
        }
    }

    /// Wait for the first update matching `pred`, skipping the rest.
    async fn wait_for(&mut self, pred: impl Fn(&ClientUpdate) -> bool) -> ClientUpdate {
        loop {
            let update = tokio::time::timeout(Duration::from_secs(5), self.updates.recv())
                .await
                .expect("timed out waiting for a client update")
                .expect("client stopped");
            if pred(&update) {
                return update;
            }
        }
    }

    async fn send(&self, cmd: ClientCommand) {
        self.commands.send(cmd).await.expect("client command");
    }

    async fn shutdown(self) {
        drop(self.commands);
        drop(self.updates);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

fn options(port: u16, session_path: std::path::PathBuf) -> ClientOptions {
    let mut options = ClientOptions::new(format!("ws://127.0.0.1:{}/ws", port));
    options.session_path = Some(session_path);
    options.reconnect_delay = Duration::from_millis(100);
    options
}

#[tokio::test]
async fn approve_runs_the_confirmed_action_and_session_survives_restart() {
    let runtime = Arc::new(ScriptedRuntime::new(script));
    let port = start(state_with(Config::default(), runtime.clone(), None)).await;
    let dir = std::env::temp_dir().join(format!("plg-client-e2e-{}", uuid::Uuid::new_v4()));
    let session_path = dir.join("client_session");

    let mut client = Client::spawn(options(port, session_path.clone()));
    client
        .wait_for(|u| *u == ClientUpdate::Status(ConnectionStatus::Ready))
        .await;

    client.send(ClientCommand::Chat("delete project P".to_string())).await;
    let ClientUpdate::Confirm(payload) = client
        .wait_for(|u| matches!(u, ClientUpdate::Confirm(_) | ClientUpdate::Error(_)))
        .await
    else {
        panic!("expected a confirmation");
    };
    assert_eq!(payload.action_id, "a1");
    assert_eq!(payload.target.as_deref(), Some("/api/projects/P"));

    client.send(ClientCommand::Approve).await;
    let done = client
        .wait_for(|u| matches!(u, ClientUpdate::Reply(_) | ClientUpdate::Error(_)))
        .await;
    assert_eq!(done, ClientUpdate::Reply("Deleted project P.".to_string()));

    let stored = lib::client::store::load_session_id(&session_path).expect("stored session id");
    assert!(stored.starts_with("sess-"));
    client.shutdown().await;

    // A new client picks up the stored id and resumes the same thread.
    let mut client = Client::spawn(options(port, session_path.clone()));
    client
        .wait_for(|u| *u == ClientUpdate::Status(ConnectionStatus::Ready))
        .await;
    client.send(ClientCommand::Chat("still there?".to_string())).await;
    let done = client
        .wait_for(|u| matches!(u, ClientUpdate::Reply(_) | ClientUpdate::Error(_)))
        .await;
    assert_eq!(done, ClientUpdate::Reply("echo: still there?".to_string()));
    client.shutdown().await;

    let refs: Vec<Option<String>> = runtime.calls().into_iter().map(|c| c.thread_ref).collect();
    assert_eq!(
        refs,
        vec![
            None,
            Some("thread-1".to_string()),
            Some("thread-1".to_string())
        ]
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn cancel_is_local_and_reset_clears_the_stored_session() {
    let runtime = Arc::new(ScriptedRuntime::new(script));
    let port = start(state_with(Config::default(), runtime.clone(), None)).await;
    let dir = std::env::temp_dir().join(format!("plg-client-e2e-{}", uuid::Uuid::new_v4()));
    let session_path = dir.join("client_session");

    let mut client = Client::spawn(options(port, session_path.clone()));
    client
        .wait_for(|u| *u == ClientUpdate::Status(ConnectionStatus::Ready))
        .await;

    client.send(ClientCommand::Chat("delete project P".to_string())).await;
    client
        .wait_for(|u| matches!(u, ClientUpdate::Confirm(_)))
        .await;
    client.send(ClientCommand::Cancel).await;
    let canceled = client
        .wait_for(|u| matches!(u, ClientUpdate::Canceled(_) | ClientUpdate::Error(_)))
        .await;
    assert!(matches!(canceled, ClientUpdate::Canceled(ref p) if p.action_id == "a1"));
    assert_eq!(runtime.calls().len(), 1);

    client.send(ClientCommand::Reset).await;
    client.wait_for(|u| *u == ClientUpdate::Reset).await;
    assert_eq!(lib::client::store::load_session_id(&session_path), None);
    client.shutdown().await;
    let _ = std::fs::remove_dir_all(&dir);
}
