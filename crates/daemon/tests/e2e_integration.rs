//! End-to-end integration tests for muxcast.
//!
//! These tests run the real orchestrator and WebSocket listener against a
//! scripted session backend and talk to it with real WebSocket clients:
//! - Upgrade-time session resolution
//! - Attach, history replay and live fan-out
//! - Input, resize and logging control frames
//! - Grace period, process exit and daemon shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use daemon::config::Config;
use daemon::events::{EngineEvent, TeardownReason};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use daemon::session::{CaptureMode, LifecycleState, ProcessStatus, SessionBackend};
use daemon::testing::{ScriptedBackend, ScriptedProcessHandle};
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HISTORY_COMPLETE: &str = r#"{"type":"history-complete"}"#;
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    orchestrator: DaemonOrchestrator,
    backend: Arc<ScriptedBackend>,
    addr: SocketAddr,
    _temp_dir: TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        config.session.write_timeout_ms = 2000;
        adjust(&mut config);

        let backend = Arc::new(ScriptedBackend::with_sessions(["build-1", "shared"]));
        let mut orchestrator = DaemonOrchestrator::with_backend(
            config,
            Arc::clone(&backend) as Arc<dyn SessionBackend>,
        )
        .unwrap();
        orchestrator.start().await.unwrap();
        let addr = orchestrator.local_addr().unwrap();

        Self {
            orchestrator,
            backend,
            addr,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn connect(&self, path: &str) -> Client {
        let (client, _response) = connect_async(self.url(path)).await.unwrap();
        client
    }

    /// Connects and waits for the end of history replay.
    async fn join(&self, session: &str) -> Client {
        let mut client = self.connect(&format!("/sessions/{session}")).await;
        expect_text(&mut client, HISTORY_COMPLETE).await;
        client
    }

    async fn process(&self, session: &str) -> ScriptedProcessHandle {
        let backend = Arc::clone(&self.backend);
        let name = session.to_string();
        wait_until(move || backend.process(&name).is_some()).await;
        self.backend.process(session).unwrap()
    }
}

async fn next_message(client: &mut Client) -> Message {
    match tokio::time::timeout(STEP_TIMEOUT, client.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => panic!("socket error: {e}"),
        Ok(None) => panic!("socket ended"),
        Err(_) => panic!("timed out waiting for a message"),
    }
}

async fn expect_text(client: &mut Client, expected: &str) {
    match next_message(client).await {
        Message::Text(text) => assert_eq!(text, expected),
        other => panic!("expected text {expected}, got {other:?}"),
    }
}

async fn expect_binary(client: &mut Client, expected: &[u8]) {
    match next_message(client).await {
        Message::Binary(data) => assert_eq!(data, expected),
        other => panic!("expected binary {:?}, got {other:?}", String::from_utf8_lossy(expected)),
    }
}

async fn expect_close(client: &mut Client, code: CloseCode) -> String {
    match next_message(client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, code);
            frame.reason.into_owned()
        }
        other => panic!("expected close {code:?}, got {other:?}"),
    }
}

async fn next_teardown(events: &mut broadcast::Receiver<EngineEvent>) -> TeardownReason {
    loop {
        match tokio::time::timeout(STEP_TIMEOUT, events.recv()).await {
            Ok(Ok(EngineEvent::SessionTornDown { reason, .. })) => return reason,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("event stream failed: {e}"),
            Err(_) => panic!("timed out waiting for teardown"),
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Handshake Tests
// =============================================================================

#[tokio::test]
async fn test_unknown_path_is_404() {
    let harness = Harness::start().await;

    match connect_async(harness.url("/elsewhere/build-1")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_invalid_session_name_is_400() {
    let harness = Harness::start().await;

    match connect_async(harness.url("/sessions/a:b")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }
    assert_eq!(harness.backend.spawn_count(), 0);
}

#[tokio::test]
async fn test_missing_session_closes_with_error() {
    let harness = Harness::start().await;
    let mut client = harness.connect("/sessions/ghost").await;

    let reason = expect_close(&mut client, CloseCode::Error).await;
    assert!(reason.contains("ghost"), "reason: {reason}");
    assert_eq!(harness.orchestrator.registry().count(), 0);
}

// =============================================================================
// Streaming Tests
// =============================================================================

#[tokio::test]
async fn test_output_reaches_viewer_in_order() {
    let harness = Harness::start().await;
    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;

    assert!(process.emit("hello").await);
    assert!(process.emit("world").await);

    expect_binary(&mut client, b"hello").await;
    expect_binary(&mut client, b"world").await;
    assert_eq!(harness.backend.spawn_count(), 1);
}

#[tokio::test]
async fn test_history_precedes_live_output() {
    let harness = Harness::start().await;
    harness.backend.set_capture(
        "build-1",
        CaptureMode::Joined,
        Ok("$ make\nok\n\n".to_string()),
    );

    let mut client = harness.connect("/sessions/build-1").await;
    expect_binary(&mut client, b"$ make\r\nok\r\n").await;
    expect_text(&mut client, HISTORY_COMPLETE).await;

    let process = harness.process("build-1").await;
    assert!(process.emit("live").await);
    expect_binary(&mut client, b"live").await;
}

#[tokio::test]
async fn test_output_during_replay_reaches_joining_viewer() {
    let harness = Harness::start().await;
    let mut first = harness.join("build-1").await;
    let process = harness.process("build-1").await;

    harness
        .backend
        .set_capture("build-1", CaptureMode::Joined, Ok("hello\n".to_string()));
    harness
        .backend
        .set_capture_delay(CaptureMode::Joined, Duration::from_millis(100));
    let captures_before = harness.backend.capture_calls().len();

    let mut second = harness.connect("/sessions/build-1").await;
    let backend = Arc::clone(&harness.backend);
    wait_until(move || backend.capture_calls().len() > captures_before).await;

    // The second viewer's replay is in flight.
    assert!(process.emit("world\n").await);

    expect_binary(&mut second, b"hello\r\n").await;
    expect_text(&mut second, HISTORY_COMPLETE).await;
    expect_binary(&mut second, b"world\n").await;
    expect_binary(&mut first, b"world\n").await;
}

#[tokio::test]
async fn test_viewers_share_one_process() {
    let harness = Harness::start().await;
    let mut first = harness.join("shared").await;
    let mut second = harness.join("shared").await;
    let process = harness.process("shared").await;

    let state = harness.orchestrator.registry().state("shared").unwrap();
    wait_until(|| state.viewer_count() == 2).await;

    for chunk in ["one", "two", "three"] {
        assert!(process.emit(chunk).await);
    }
    for client in [&mut first, &mut second] {
        expect_binary(client, b"one").await;
        expect_binary(client, b"two").await;
        expect_binary(client, b"three").await;
    }
    assert_eq!(harness.backend.spawn_count_for("shared"), 1);
}

#[tokio::test]
async fn test_input_is_forwarded() {
    let harness = Harness::start().await;
    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;

    client.send(Message::Binary(b"ls\r".to_vec())).await.unwrap();
    client.send(Message::Text("pwd\r".to_string())).await.unwrap();

    let observed = process.clone();
    wait_until(move || observed.input() == b"ls\rpwd\r").await;
}

#[tokio::test]
async fn test_resize_is_not_forwarded_as_input() {
    let harness = Harness::start().await;
    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;

    client
        .send(Message::Text(r#"{"type":"resize","cols":100,"rows":40}"#.to_string()))
        .await
        .unwrap();

    let observed = process.clone();
    wait_until(move || observed.size() == (100, 40)).await;
    assert!(process.input().is_empty());
}

#[tokio::test]
async fn test_set_logging_toggles_session_log() {
    let harness = Harness::start().await;
    let mut client = harness.join("build-1").await;
    let state = harness.orchestrator.registry().state("build-1").unwrap();
    assert!(state.logging_enabled());

    client
        .send(Message::Text(r#"{"type":"set-logging","enabled":false}"#.to_string()))
        .await
        .unwrap();

    let observed = Arc::clone(&state);
    wait_until(move || !observed.logging_enabled()).await;
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_reattach_within_grace_reuses_process() {
    let harness = Harness::start_with(|config| config.session.grace_period_secs = 2).await;
    let registry = Arc::clone(harness.orchestrator.registry());

    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;
    client.close(None).await.unwrap();

    let observed = Arc::clone(&registry);
    wait_until(move || observed.lifecycle("build-1") == Some(LifecycleState::Grace)).await;

    let mut client = harness.join("build-1").await;
    assert_eq!(registry.lifecycle("build-1"), Some(LifecycleState::Active));
    assert_eq!(harness.backend.spawn_count_for("build-1"), 1);

    assert!(process.emit("still here").await);
    expect_binary(&mut client, b"still here").await;
}

#[tokio::test]
async fn test_grace_expiry_kills_process() {
    let harness = Harness::start_with(|config| config.session.grace_period_secs = 1).await;
    let mut events = harness.orchestrator.engine_events();

    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;
    client.close(None).await.unwrap();

    assert_eq!(next_teardown(&mut events).await, TeardownReason::GraceExpired);
    assert!(process.is_killed());
    assert!(!harness.orchestrator.registry().exists("build-1"));
}

#[tokio::test]
async fn test_process_exit_closes_viewers() {
    let harness = Harness::start().await;
    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;

    process.exit(0);

    expect_close(&mut client, CloseCode::Normal).await;
    let registry = Arc::clone(harness.orchestrator.registry());
    wait_until(move || !registry.exists("build-1")).await;
    assert!(!process.is_killed());
}

#[tokio::test]
async fn test_reattach_after_exit_spawns_again() {
    let harness = Harness::start().await;
    let mut events = harness.orchestrator.engine_events();
    let mut client = harness.join("build-1").await;
    harness.process("build-1").await.exit(3);
    expect_close(&mut client, CloseCode::Normal).await;

    assert_eq!(
        next_teardown(&mut events).await,
        TeardownReason::ProcessExited(ProcessStatus::Exited(3))
    );
    assert!(!harness.orchestrator.registry().exists("build-1"));

    let _client = harness.join("build-1").await;
    assert_eq!(harness.backend.spawn_count_for("build-1"), 2);
}

#[tokio::test]
async fn test_shutdown_closes_viewers_and_kills_sessions() {
    let mut harness = Harness::start().await;
    let mut client = harness.join("build-1").await;
    let process = harness.process("build-1").await;

    harness.orchestrator.stop().await.unwrap();

    expect_close(&mut client, CloseCode::Normal).await;
    assert!(process.is_killed());
    assert_eq!(harness.orchestrator.registry().count(), 0);
    assert_eq!(harness.orchestrator.state().await, OrchestratorState::Stopped);
    assert!(TcpStream::connect(harness.addr).await.is_err());
}
