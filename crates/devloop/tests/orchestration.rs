//! End-to-end orchestration tests
//!
//! Container services run against the in-memory engine; process services are
//! real `sh` processes.

#![cfg(unix)]

use devloop::runtime::engine::mock::MockEngine;
use devloop::{LogConfig, Manifest, Orchestrator, OrchestratorConfig, OrchestratorError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEMO: &str = r#"
name: demo
services:
  cache:
    image: redis:7
    port: 6390
    healthcheck:
      type: process
  api:
    command: sh
    args: ["-c", "echo \"api sees $SERVICE_URL_CACHE\"; echo listening; exec sleep 30"]
    port: 8089
    uses: [cache, db]
    env:
      DB_URL: "postgres://localhost/${DB_NAME}"
    healthcheck:
      type: log
      pattern: listening
      timeout_secs: 5
      interval_ms: 20
  web:
    command: sh
    args: ["-c", "echo \"web sees $SERVICE_URL_API\"; exec sleep 30"]
    uses: [api]
    healthcheck:
      type: process
resources:
  db:
    type: postgres
"#;

fn config(dir: &std::path::Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        project_dir: dir.to_path_buf(),
        stop_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    config
        .extra_env
        .insert("DB_NAME".to_string(), "demo".to_string());
    config
}

async fn wait_for_log(orch: &Orchestrator, service: &str, needle: &str) -> bool {
    for _ in 0..100 {
        if let Some(buffer) = orch.logs().buffer(service) {
            if buffer.contains(needle) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_start_and_stop_all() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let mut orch = Orchestrator::new(
        Manifest::from_yaml(DEMO).unwrap(),
        config(dir.path()),
        engine.clone(),
    )
    .unwrap();

    let (_tx, rx) = watch::channel(());
    orch.start_all(rx).await.unwrap();

    for name in ["cache", "api", "web"] {
        assert!(orch.process(name).unwrap().ready, "{name} should be ready");
    }

    // Bindings of earlier levels reach later ones
    assert!(wait_for_log(&orch, "api", "api sees http://localhost:6390").await);
    assert!(wait_for_log(&orch, "web", "web sees http://localhost:8089").await);

    let urls = orch.service_urls();
    assert_eq!(urls["cache"], "http://localhost:6390");
    assert_eq!(urls["api"], "http://localhost:8089");
    assert!(!urls.contains_key("web"));

    let status = orch.status().await;
    assert_eq!(status.len(), 3);
    assert!(status.iter().all(|s| s.alive));

    let api_env = &orch.process("api").unwrap().env;
    assert_eq!(api_env["SERVICE_PORT_CACHE"], "6390");
    assert_eq!(api_env["DB_URL"], "postgres://localhost/demo");

    orch.stop_all().await;

    assert!(engine.container("devloop-cache").is_none());
    assert!(orch.process("api").is_none());
    assert!(orch.logs().service_names().is_empty());

    let api_log = std::fs::read_to_string(dir.path().join(".azure/logs/api.log")).unwrap();
    assert!(api_log.contains("[OUT] listening"));
}

#[tokio::test]
async fn test_running_container_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let id = engine.add_container("devloop-cache", "redis:7", true);

    let mut config = config(dir.path());
    config.services = vec!["cache".to_string()];
    let mut orch =
        Orchestrator::new(Manifest::from_yaml(DEMO).unwrap(), config, engine.clone()).unwrap();

    let (_tx, rx) = watch::channel(());
    orch.start_all(rx).await.unwrap();

    assert_eq!(engine.count("run"), 0);
    assert_eq!(
        orch.process("cache").unwrap().container_id(),
        Some(id.as_str())
    );
    assert!(orch.process("api").is_none());

    orch.stop_all().await;
}

#[tokio::test]
async fn test_start_failure_keeps_started_services() {
    let yaml = r#"
services:
  base:
    command: sh
    args: ["-c", "exec sleep 30"]
    healthcheck:
      type: process
  broken:
    command: devloop-no-such-binary
    uses: [base]
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::new(
        Manifest::from_yaml(yaml).unwrap(),
        config(dir.path()),
        Arc::new(MockEngine::new()),
    )
    .unwrap();

    let (_tx, rx) = watch::channel(());
    match orch.start_all(rx).await {
        Err(OrchestratorError::Service { service, .. }) => assert_eq!(service, "broken"),
        other => panic!("expected a service failure, got {:?}", other.err()),
    }

    assert!(orch.process("base").is_some());
    assert!(orch.process("broken").is_none());

    orch.stop_all().await;
    assert!(orch.process("base").is_none());
}

#[tokio::test]
async fn test_service_exiting_before_ready() {
    let yaml = r#"
services:
  flaky:
    command: sh
    args: ["-c", "exit 1"]
    healthcheck:
      type: log
      pattern: never printed
      timeout_secs: 2
      interval_ms: 20
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::new(
        Manifest::from_yaml(yaml).unwrap(),
        OrchestratorConfig {
            log: LogConfig {
                file_logging: false,
                ..Default::default()
            },
            ..config(dir.path())
        },
        Arc::new(MockEngine::new()),
    )
    .unwrap();

    let (_tx, rx) = watch::channel(());
    assert!(matches!(
        orch.start_all(rx).await,
        Err(OrchestratorError::Service { .. })
    ));
    assert!(!orch.process("flaky").unwrap().ready);

    orch.stop_all().await;
}

#[tokio::test]
async fn test_shutdown_cancels_readiness_wait() {
    let yaml = r#"
services:
  slow:
    command: sh
    args: ["-c", "echo booting; exec sleep 30"]
    healthcheck:
      type: log
      pattern: never printed
      timeout_secs: 5
      interval_ms: 20
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::new(
        Manifest::from_yaml(yaml).unwrap(),
        config(dir.path()),
        Arc::new(MockEngine::new()),
    )
    .unwrap();

    let (tx, rx) = watch::channel(());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(());
    });

    let started = std::time::Instant::now();
    assert!(matches!(
        orch.start_all(rx).await,
        Err(OrchestratorError::Aborted)
    ));
    assert!(started.elapsed() < Duration::from_secs(2));

    // The handle survives the abort so the process can still be stopped
    let process = orch.process("slow").unwrap();
    assert!(!process.ready);
    assert!(process.pid().is_some());

    orch.stop_all().await;
    assert!(orch.process("slow").is_none());
}

#[tokio::test]
async fn test_filtered_lines_never_reach_buffers() {
    let yaml = r#"
services:
  api:
    command: sh
    args: ["-c", "echo 'Debugger listening on ws://127.0.0.1:9229'; echo 'GET /health 200'; echo ready; exec sleep 30"]
    healthcheck:
      type: log
      pattern: ready
      timeout_secs: 5
      interval_ms: 20
logs:
  filters:
    exclude: ["^GET /health"]
"#;
    let dir = tempfile::tempdir().unwrap();
    let mut orch = Orchestrator::new(
        Manifest::from_yaml(yaml).unwrap(),
        config(dir.path()),
        Arc::new(MockEngine::new()),
    )
    .unwrap();

    let (_tx, rx) = watch::channel(());
    orch.start_all(rx).await.unwrap();

    let buffer = orch.logs().buffer("api").unwrap();
    let messages: Vec<String> = buffer.recent(0).into_iter().map(|e| e.message).collect();
    assert_eq!(messages, vec!["ready"]);

    orch.stop_all().await;
}
