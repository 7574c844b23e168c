//! Daemon connection client.
//!
//! This module provides the `DaemonClient` which handles:
//! - Connection to the daemon via Unix socket
//! - The `connect` handshake and version check
//! - Request/response exchanges, keeping broadcasts that arrive in between
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

use pxv_core::SessionState;
use pxv_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::error::{ClientError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the daemon client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// Limit on establishing the connection and handshake.
    pub connect_timeout: Duration,

    /// Limit on waiting for a reply to one request.
    pub response_timeout: Duration,

    /// Sent in the handshake; the daemon assigns one when absent.
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/pxvd.sock"),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            client_id: None,
        }
    }
}

/// Session snapshot returned by [`DaemonClient::get_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub profile_name: String,
    pub connected_since: Option<DateTime<Utc>>,
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A connected, handshaken client session with the daemon.
pub struct DaemonClient {
    config: ClientConfig,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    /// Broadcasts read while waiting for a reply.
    pending: VecDeque<DaemonMessage>,
}

impl DaemonClient {
    /// Connects and performs the handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let connect_timeout = config.connect_timeout;
        match timeout(connect_timeout, Self::connect_inner(config)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn connect_inner(config: ClientConfig) -> Result<Self> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| ClientError::DaemonConnection {
                path: config.socket_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            pending: VecDeque::new(),
            config,
        };

        client
            .send(&ClientMessage::connect(client.config.client_id.clone()))
            .await?;
        match client.read().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(client_id = %client_id, protocol_version = %protocol_version, "Handshake complete");
                client.client_id = client_id;
                Ok(client)
            }
            DaemonMessage::Rejected {
                reason,
                protocol_version,
            } => {
                debug!(daemon_version = %protocol_version, "Handshake rejected");
                Err(ClientError::Rejected(reason))
            }
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Returns the session state, active profile name and uptime origin.
    pub async fn get_state(&mut self) -> Result<SessionStatus> {
        match self.request(&ClientMessage::get_state()).await? {
            DaemonMessage::State {
                state,
                profile_name,
                connected_since,
            } => Ok(SessionStatus {
                state,
                profile_name,
                connected_since,
            }),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.command(ClientMessage::start()).await
    }

    /// Stops the session; `shutdown` also releases the daemon.
    pub async fn stop(&mut self, shutdown: bool) -> Result<()> {
        self.command(ClientMessage::stop(shutdown)).await
    }

    pub async fn reload(&mut self) -> Result<()> {
        self.command(ClientMessage::reload()).await
    }

    /// Registers this connection for state-change broadcasts.
    pub async fn register_callback(&mut self) -> Result<()> {
        self.command(ClientMessage::register_callback()).await
    }

    pub async fn unregister_callback(&mut self) -> Result<()> {
        self.command(ClientMessage::unregister_callback()).await
    }

    /// Subscribes to per-second traffic updates. Requires a callback.
    pub async fn start_bandwidth(&mut self) -> Result<()> {
        self.command(ClientMessage::start_bandwidth()).await
    }

    pub async fn stop_bandwidth(&mut self) -> Result<()> {
        self.command(ClientMessage::stop_bandwidth()).await
    }

    pub async fn ping(&mut self, seq: u64) -> Result<()> {
        match self.request(&ClientMessage::ping(seq)).await? {
            DaemonMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Waits for the next broadcast. No timeout.
    pub async fn next_event(&mut self) -> Result<DaemonMessage> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        self.read().await
    }

    /// Sends `disconnect` and closes the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    // ========================================================================
    // Wire
    // ========================================================================

    async fn command(&mut self, msg: ClientMessage) -> Result<()> {
        let expected = msg.message.name();
        match self.request(&msg).await? {
            DaemonMessage::Accepted { command } if command == expected => Ok(()),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Sends `msg` and returns the first reply that is not a broadcast.
    async fn request(&mut self, msg: &ClientMessage) -> Result<DaemonMessage> {
        self.send(msg).await?;
        let response_timeout = self.config.response_timeout;
        loop {
            let reply = match timeout(response_timeout, self.read()).await {
                Ok(reply) => reply?,
                Err(_) => return Err(ClientError::Timeout),
            };
            match reply {
                DaemonMessage::StateChanged { .. }
                | DaemonMessage::TrafficUpdated { .. }
                | DaemonMessage::TrafficPersisted { .. } => self.pending.push_back(reply),
                DaemonMessage::Error { message, code } => {
                    return Err(ClientError::Daemon { message, code })
                }
                other => return Ok(other),
            }
        }
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let mut json = serde_json::to_string(msg)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        debug!(message_type = msg.message.name(), "Sent message");
        Ok(())
    }

    async fn read(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }
}
