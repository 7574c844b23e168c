//! pxv client library.
//!
//! Connects to the pxv daemon over its Unix socket, performs the protocol
//! handshake, and exposes the daemon's commands as async methods. Used by
//! the `pxv` command-line client.

pub mod client;
pub mod error;

pub use client::{ClientConfig, DaemonClient, SessionStatus};
pub use error::{ClientError, Result};
