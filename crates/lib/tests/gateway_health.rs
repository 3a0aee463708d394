//! Integration test: start the gateway on a free port, GET /health and /, assert the JSON.
//! Does not require codex; no turn is run. The server task is left running when the test ends.

use lib::config::Config;
use lib::gateway;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_config_dir() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("plg-gateway-test-{}", uuid::Uuid::new_v4()));
    let skill = dir.join("skills").join("projects");
    std::fs::create_dir_all(&skill).expect("create skills dir");
    std::fs::write(
        skill.join("SKILL.md"),
        "---\nname: projects\ndescription: Manage projects\n---\n\n## Read Endpoints\n- GET /api/projects\n",
    )
    .expect("write SKILL.md");
    let config_path = dir.join("config.json");
    std::fs::File::create(&config_path)
        .and_then(|mut f| f.write_all(b"{}"))
        .expect("write config.json");
    (dir, config_path)
}

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = free_port();
    let (_temp_dir, config_path) = temp_config_dir();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();

    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(format!("{}/health", base)).send().await {
            Ok(resp) if resp.status().is_success() => {
                let json: serde_json::Value = resp.json().await.expect("parse JSON");
                assert_eq!(json, serde_json::json!({"status": "healthy"}));

                let status: serde_json::Value = client
                    .get(format!("{}/", base))
                    .send()
                    .await
                    .expect("GET /")
                    .json()
                    .await
                    .expect("parse JSON");
                assert_eq!(status.get("status").and_then(|v| v.as_str()), Some("running"));
                assert_eq!(status.get("name").and_then(|v| v.as_str()), Some("plg-gateway"));
                assert_eq!(status.get("sessions").and_then(|v| v.as_u64()), Some(0));
                gateway_handle.abort();
                return;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gateway_handle.abort();
    panic!(
        "GET {}/health did not return 200 within 5s; last error: {:?}",
        base, last_err
    );
}

#[tokio::test]
async fn gateway_refuses_public_bind_without_token() {
    let (_temp_dir, config_path) = temp_config_dir();
    let mut config = Config::default();
    config.gateway.port = free_port();
    config.gateway.bind = "0.0.0.0".to_string();
    if std::env::var("PLG_GATEWAY_TOKEN").is_ok() {
        return;
    }
    let err = gateway::run_gateway(config, config_path)
        .await
        .expect_err("public bind without auth must fail");
    assert!(err.to_string().contains("refusing to bind"));
}
