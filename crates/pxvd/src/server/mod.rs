//! Unix socket control server.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Forwards start/stop/reload requests to the session controller
//! - Registers callback clients as observers so they receive broadcasts
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌───────────────────┐
//! │ConnectionHandler│────▶│ SessionController │
//! │   (per client)  │     └─────────┬─────────┘
//! └───────▲─────────┘               │ broadcast
//!         │ outbox                  ▼
//! ┌───────┴─────────┐     ┌───────────────────┐
//! │ SocketObserver  │◀────│  ObserverActor    │
//! └─────────────────┘     └───────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, SocketObserver};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::SessionController;

/// Maximum number of clients registered for callbacks at once.
pub const MAX_CALLBACK_CLIENTS: usize = 10;

/// Unix socket server for the pxv daemon.
pub struct DaemonServer {
    socket_path: PathBuf,
    controller: Arc<SessionController>,
    cancel_token: CancellationToken,
    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        controller: Arc<SessionController>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            controller,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered.
    /// This method does not return until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Daemon server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_err = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_err)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_err)?;
            }
        }
        UnixListener::bind(&self.socket_path).map_err(setup_err)
    }

    fn handle_connection(&self, stream: tokio::net::UnixStream, connection_number: u64) {
        let (reader, writer) = stream.into_split();
        let controller = Arc::clone(&self.controller);

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(reader, writer, controller, connection_number);
            if let Some(client_id) = handler.run().await {
                debug!(client_id = %client_id, "Connection handler finished");
            }
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        info!("Server cleanup complete");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}
