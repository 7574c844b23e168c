//! Integration tests for the Unix socket server.
//!
//! These tests drive a real `DaemonServer` over a socket, backed by a
//! session controller whose collaborators are faked.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::*;
use pxv_core::SessionState;
use pxv_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use pxvd::server::{DaemonServer, MAX_CALLBACK_CLIENTS};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    harness: Harness,
}

impl TestServer {
    async fn spawn_with(harness: Harness) -> Self {
        let socket_path = harness.dir.path().join("test.sock");
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::new(
            socket_path.clone(),
            std::sync::Arc::clone(&harness.controller),
            cancel_token.clone(),
        );
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            cancel_token,
            harness,
        }
    }

    /// Spawns a server whose current profile has a numeric host.
    async fn spawn() -> Self {
        let store = MemoryStore::with_current(profile(1, "10.0.0.1"));
        Self::spawn_with(HarnessBuilder::new(store).build()).await
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn connect_ready(&self) -> TestClient {
        let mut client = self.connect().await;
        client.handshake(None).await;
        client
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        let mut line = String::new();
        tokio::time::timeout(EVENT_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for daemon message")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Reads messages until a state change to `state` arrives.
    async fn recv_state(&mut self, state: SessionState) -> Option<String> {
        loop {
            if let DaemonMessage::StateChanged {
                state: got,
                message,
                ..
            } = self.recv().await
            {
                if got == state {
                    return message;
                }
            }
        }
    }

    async fn handshake(&mut self, client_id: Option<String>) -> String {
        self.send(ClientMessage::connect(client_id)).await;
        match self.recv().await {
            DaemonMessage::Connected { client_id, .. } => client_id,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn expect_accepted(&mut self, command: &str) {
        match self.recv().await {
            DaemonMessage::Accepted { command: got } => assert_eq!(got, command),
            other => panic!("Expected Accepted({command}), got {other:?}"),
        }
    }
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_success() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage::connect(Some("test-client".to_string())))
        .await;

    match client.recv().await {
        DaemonMessage::Connected {
            protocol_version,
            client_id,
        } => {
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
            assert_eq!(client_id, "test-client");
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_auto_assigns_client_id() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let client_id = client.handshake(None).await;
    assert!(
        client_id.starts_with("client-"),
        "Expected auto-assigned ID starting with 'client-', got: {client_id}"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(ClientMessage {
            protocol_version: ProtocolVersion::new(99, 0),
            message: MessageType::Connect { client_id: None },
        })
        .await;

    match client.recv().await {
        DaemonMessage::Rejected { reason, .. } => {
            assert!(reason.contains("not compatible"), "unexpected reason: {reason}");
        }
        other => panic!("Expected Rejected, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_first_message_must_be_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::get_state()).await;

    assert!(matches!(client.recv().await, DaemonMessage::Error { .. }));
    server.shutdown().await;
}

// ============================================================================
// Request Tests
// ============================================================================

#[tokio::test]
async fn test_get_state_when_idle() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send(ClientMessage::get_state()).await;

    assert_eq!(
        client.recv().await,
        DaemonMessage::State {
            state: SessionState::Stopped,
            profile_name: "Idle".to_string(),
            connected_since: None,
        }
    );
    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send(ClientMessage::ping(7)).await;

    assert_eq!(client.recv().await, DaemonMessage::Pong { seq: 7 });
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send_raw("{not json").await;
    match client.recv().await {
        DaemonMessage::Error { code, .. } => assert_eq!(code.as_deref(), Some("parse_error")),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.send(ClientMessage::ping(1)).await;
    assert_eq!(client.recv().await, DaemonMessage::Pong { seq: 1 });
    server.shutdown().await;
}

#[tokio::test]
async fn test_start_bandwidth_requires_callback() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send(ClientMessage::start_bandwidth()).await;

    match client.recv().await {
        DaemonMessage::Error { message, .. } => {
            assert!(message.contains("Register"), "unexpected message: {message}");
        }
        other => panic!("Expected Error, got {other:?}"),
    }
    server.shutdown().await;
}

// ============================================================================
// Callback Tests
// ============================================================================

#[tokio::test]
async fn test_callback_sees_full_session() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send(ClientMessage::register_callback()).await;
    client.expect_accepted("register_callback").await;

    client.send(ClientMessage::start()).await;
    client.expect_accepted("start").await;
    assert_eq!(client.recv_state(SessionState::Connecting).await, None);
    assert_eq!(client.recv_state(SessionState::Connected).await, None);

    client.send(ClientMessage::get_state()).await;
    loop {
        if let DaemonMessage::State {
            state,
            profile_name,
            connected_since,
        } = client.recv().await
        {
            assert_eq!(state, SessionState::Connected);
            assert_eq!(profile_name, "10.0.0.1:8388");
            assert!(connected_since.is_some());
            break;
        }
    }

    client.send(ClientMessage::stop(false)).await;
    client.expect_accepted("stop").await;
    assert_eq!(client.recv_state(SessionState::Stopped).await, None);

    server.shutdown().await;
}

#[tokio::test]
async fn test_command_from_one_client_reaches_another() {
    let server = TestServer::spawn().await;
    let mut watcher = server.connect_ready().await;
    watcher.send(ClientMessage::register_callback()).await;
    watcher.expect_accepted("register_callback").await;

    let mut commander = server.connect_ready().await;
    commander.send(ClientMessage::start()).await;
    commander.expect_accepted("start").await;

    watcher.recv_state(SessionState::Connected).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_start_reports_message() {
    let harness = HarnessBuilder::new(MemoryStore::default()).build();
    let server = TestServer::spawn_with(harness).await;
    let mut client = server.connect_ready().await;
    client.send(ClientMessage::register_callback()).await;
    client.expect_accepted("register_callback").await;

    client.send(ClientMessage::start()).await;
    client.expect_accepted("start").await;

    assert_eq!(
        client.recv_state(SessionState::Stopped).await.as_deref(),
        Some("Profile empty")
    );
    server.shutdown().await;
}

#[tokio::test]
async fn test_callback_limit_is_enforced() {
    let server = TestServer::spawn().await;
    let mut clients = Vec::new();
    for _ in 0..MAX_CALLBACK_CLIENTS {
        let mut client = server.connect_ready().await;
        client.send(ClientMessage::register_callback()).await;
        client.expect_accepted("register_callback").await;
        clients.push(client);
    }

    let mut extra = server.connect_ready().await;
    extra.send(ClientMessage::register_callback()).await;
    match extra.recv().await {
        DaemonMessage::Error { message, .. } => {
            assert!(message.contains("Too many"), "unexpected message: {message}");
        }
        other => panic!("Expected Error, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_releases_callback() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;
    client.send(ClientMessage::register_callback()).await;
    client.expect_accepted("register_callback").await;
    assert_eq!(
        server.harness.controller.observers().counts().await.unwrap().registered,
        1
    );

    client.send(ClientMessage::disconnect()).await;
    drop(client);

    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let counts = server.harness.controller.observers().counts().await.unwrap();
        if counts.registered == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "callback never released");
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_removes_socket() {
    let server = TestServer::spawn().await;
    let socket_path = server.socket_path.clone();

    server.shutdown().await;

    assert!(!socket_path.exists());
}
