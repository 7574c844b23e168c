//! pxv Core - Shared types for proxy session supervision
//!
//! This crate provides the domain types shared between
//! the daemon (pxvd) and its clients (pxv).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod plugin;
pub mod profile;
pub mod state;
pub mod traffic;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use plugin::{PluginConfiguration, PluginOptions};
pub use profile::{is_numeric_address, Profile, ProfileId, Route};
pub use state::SessionState;
pub use traffic::TrafficSample;
