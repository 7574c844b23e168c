//! pxv Protocol - Wire protocol for daemon communication
//!
//! Newline-delimited JSON exchanged over the daemon's Unix socket between
//! `pxvd` and its clients. Every client message carries the protocol
//! version; the daemon answers the `connect` handshake with `connected`
//! or `rejected`.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
