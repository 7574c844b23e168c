//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes commands to the session controller and observer registry
//! - Queues responses and broadcasts through one outbox, so a client sees
//!   them in the order they were produced
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use pxv_core::{ProfileId, SessionState, TrafficSample};
use pxv_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use super::MAX_CALLBACK_CLIENTS;
use crate::observer::{Observer, ObserverError, ObserverId, ObserverRegistryError};
use crate::session::SessionController;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections without callbacks (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages queued for one client before broadcasts start failing.
const OUTBOX_CAPACITY: usize = 256;

type ClientId = String;

// ============================================================================
// Socket observer
// ============================================================================

/// Delivers broadcasts to one connected client.
///
/// Never blocks: a full outbox is reported as a delivery failure, a
/// closed one as a disconnect.
pub struct SocketObserver {
    client_id: ClientId,
    outbox: mpsc::Sender<DaemonMessage>,
}

impl SocketObserver {
    pub fn new(client_id: ClientId, outbox: mpsc::Sender<DaemonMessage>) -> Self {
        Self { client_id, outbox }
    }

    fn deliver(&self, msg: DaemonMessage) -> Result<(), ObserverError> {
        self.outbox.try_send(msg).map_err(|e| match e {
            TrySendError::Closed(_) => ObserverError::Disconnected,
            TrySendError::Full(_) => {
                ObserverError::Delivery(format!("outbox full for {}", self.client_id))
            }
        })
    }
}

impl Observer for SocketObserver {
    fn state_changed(
        &self,
        state: SessionState,
        profile_name: &str,
        message: Option<&str>,
    ) -> Result<(), ObserverError> {
        self.deliver(DaemonMessage::state_changed(
            state,
            profile_name,
            message.map(str::to_string),
        ))
    }

    fn traffic_updated(
        &self,
        profile_id: ProfileId,
        sample: &TrafficSample,
    ) -> Result<(), ObserverError> {
        self.deliver(DaemonMessage::traffic_updated(profile_id, *sample))
    }

    fn traffic_persisted(&self, profile_id: ProfileId) -> Result<(), ObserverError> {
        self.deliver(DaemonMessage::traffic_persisted(profile_id))
    }
}

// ============================================================================
// Connection handler
// ============================================================================

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    outbox: mpsc::Sender<DaemonMessage>,
    controller: Arc<SessionController>,
    client_id: Option<ClientId>,
    /// Set while the client is registered for callbacks
    observer_id: Option<ObserverId>,
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a handler and spawns the writer task for `writer`.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        controller: Arc<SessionController>,
        connection_number: u64,
    ) -> Self {
        let (outbox, queue) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(run_writer(BufWriter::new(writer), queue, connection_number));
        Self {
            reader: BufReader::new(reader),
            outbox,
            controller,
            client_id: None,
            observer_id: None,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Returns the client ID if the handshake succeeded.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                return None;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        self.release_observer().await;
        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id)).await
            }
            other => {
                self.send_message(DaemonMessage::error("Expected Connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(other.name().to_string()))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Callback clients stay idle for as long as the session runs.
            let read = if self.observer_id.is_some() {
                Ok(self.read_message().await)
            } else {
                timeout(READ_TIMEOUT, self.read_message()).await
            };
            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    warn!(client_id = ?self.client_id, error = %e, "Malformed message");
                    self.send_message(DaemonMessage::error_with_code(&e, "parse_error"))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(ConnectionError::Closed) => return Err(ConnectionError::Closed),
                Err(e) => {
                    error!(client_id = ?self.client_id, error = %e, "Error handling message");
                    self.send_message(DaemonMessage::error(&e.to_string())).await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let name = msg.message.name();
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected")).await?;
            }

            MessageType::GetState => {
                let data = self.controller.data();
                self.send_message(DaemonMessage::state(
                    data.state(),
                    data.profile_name(),
                    data.connected_since(),
                ))
                .await?;
            }

            MessageType::Start => {
                self.send_message(DaemonMessage::accepted(name)).await?;
                self.controller.start().await;
            }

            MessageType::Stop { shutdown } => {
                self.send_message(DaemonMessage::accepted(name)).await?;
                self.controller.stop(shutdown).await;
            }

            MessageType::Reload => {
                self.send_message(DaemonMessage::accepted(name)).await?;
                self.controller.reload().await;
            }

            MessageType::RegisterCallback => {
                self.register_callback().await?;
                self.send_message(DaemonMessage::accepted(name)).await?;
            }

            MessageType::UnregisterCallback => {
                self.release_observer().await;
                self.send_message(DaemonMessage::accepted(name)).await?;
            }

            MessageType::StartBandwidth => {
                let id = self.observer_id.ok_or(ConnectionError::NotRegistered)?;
                self.controller.observers().start_bandwidth(id).await?;
                self.send_message(DaemonMessage::accepted(name)).await?;
            }

            MessageType::StopBandwidth => {
                let id = self.observer_id.ok_or(ConnectionError::NotRegistered)?;
                self.controller.observers().stop_bandwidth(id).await?;
                self.send_message(DaemonMessage::accepted(name)).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    async fn register_callback(&mut self) -> Result<(), ConnectionError> {
        if self.observer_id.is_some() {
            return Err(ConnectionError::UnexpectedMessage(
                "callback already registered".to_string(),
            ));
        }

        let observers = self.controller.observers();
        if observers.counts().await?.registered >= MAX_CALLBACK_CLIENTS {
            return Err(ConnectionError::TooManyCallbacks {
                max: MAX_CALLBACK_CLIENTS,
            });
        }

        let client_id = self.client_id.clone().unwrap_or_default();
        let observer = SocketObserver::new(client_id.clone(), self.outbox.clone());
        let id = observers.register(Arc::new(observer)).await?;
        self.observer_id = Some(id);
        debug!(client_id = %client_id, observer = %id, "Client registered for callbacks");
        Ok(())
    }

    async fn release_observer(&mut self) {
        let Some(id) = self.observer_id.take() else {
            return;
        };
        match self.controller.observers().unregister(id).await {
            Ok(_) => debug!(client_id = ?self.client_id, observer = %id, "Callback unregistered"),
            Err(e) => debug!(observer = %id, error = %e, "Failed to unregister callback"),
        }
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage =
            serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = msg.message.name(),
            "Received message"
        );

        Ok(msg)
    }

    /// Queues a message behind any pending broadcasts.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        self.outbox
            .send(msg)
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Drains the outbox into the socket until every sender is gone or a
/// write fails.
async fn run_writer(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut queue: mpsc::Receiver<DaemonMessage>,
    connection_number: u64,
) {
    while let Some(msg) = queue.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            debug!(connection = connection_number, error = %e, "Writer stopped");
            break;
        }
    }
}

async fn write_message(
    writer: &mut BufWriter<OwnedWriteHalf>,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Client writer closed")]
    Closed,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Register for callbacks first")]
    NotRegistered,

    #[error("Too many callback clients (max: {max})")]
    TooManyCallbacks { max: usize },

    #[error("Observer registry error: {0}")]
    Registry(#[from] ObserverRegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }

    #[tokio::test]
    async fn test_socket_observer_reports_full_and_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let observer = SocketObserver::new("client-0".to_string(), tx);

        observer.traffic_persisted(ProfileId::new(1)).unwrap();
        assert!(matches!(
            observer.traffic_persisted(ProfileId::new(1)),
            Err(ObserverError::Delivery(_))
        ));

        assert!(matches!(rx.recv().await, Some(DaemonMessage::TrafficPersisted { .. })));
        drop(rx);
        assert_eq!(
            observer.state_changed(SessionState::Stopped, "Idle", None),
            Err(ObserverError::Disconnected)
        );
    }
}
