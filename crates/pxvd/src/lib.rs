//! pxv Daemon - Proxy session lifecycle and broadcast server
//!
//! This crate provides the core infrastructure for the pxv daemon:
//! - `session` - Session controller: state machine and start/stop orchestration
//! - `observer` - Observer registry actor for state and traffic broadcasts
//! - `traffic` - Rate sampling, stat socket, and traffic persistence
//! - `server` - Unix socket server for client connections
//!
//! Everything else (`store`, `supervisor`, `resolve`, `acl`, `remote`,
//! `plugin`) is a collaborator consumed through a narrow trait, with a
//! default implementation the daemon binary wires up.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        pxvd daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│     SessionController       │   │
//! │  │ (Unix Socket)   │     │  (state machine, workers)   │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │ register                    │ broadcast        │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ SocketObserver  │◀────│     ObserverActor           │   │
//! │  │  (per client)   │     │  (serialized delivery)      │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully
//! - Poisoned std locks are recovered with `PoisonError::into_inner`

pub mod acl;
pub mod config;
pub mod config_builder;
pub mod direct_boot;
pub mod observer;
pub mod plugin;
pub mod remote;
pub mod resolve;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod traffic;
