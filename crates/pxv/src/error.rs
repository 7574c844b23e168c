//! Error types for the pxv client.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::io;
use thiserror::Error;

/// Errors talking to the daemon.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The socket could not be reached.
    #[error("Failed to connect to daemon at {path}: {reason}")]
    DaemonConnection { path: String, reason: String },

    /// The daemon and client speak incompatible protocol versions.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon refused the handshake.
    #[error("Daemon rejected connection: {0}")]
    Rejected(String),

    /// The daemon answered a request with an error.
    #[error("Daemon error: {message}")]
    Daemon {
        message: String,
        code: Option<String>,
    },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Timed out waiting for daemon")]
    Timeout,

    #[error("Daemon closed the connection")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// True when the daemon is simply not running.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::DaemonConnection { .. })
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
