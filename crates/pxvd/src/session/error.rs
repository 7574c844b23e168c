//! Session start failures and their user-facing messages.

use thiserror::Error;

use crate::acl::AclError;
use crate::config_builder::ConfigBuildError;
use crate::plugin::PluginError;
use crate::remote::BootstrapError;
use crate::resolve::ResolveError;
use crate::store::StoreError;
use crate::supervisor::LaunchError;

/// Why a session failed to start.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No current profile")]
    ProfileMissing,

    #[error("Profile is missing host or password")]
    InvalidProfile,

    #[error("Host unresolvable: {0}")]
    HostUnresolvable(#[from] ResolveError),

    #[error("Tunnel device unavailable: {0}")]
    TunnelUnavailable(String),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    ConfigBuild(#[from] ConfigBuildError),

    #[error(transparent)]
    Acl(#[from] AclError),

    #[error("{0}")]
    Unexpected(String),
}

impl SessionError {
    /// The message attached to the terminal `Stopped` broadcast.
    pub fn user_message(&self) -> String {
        match self {
            Self::ProfileMissing => "Profile empty".to_string(),
            Self::InvalidProfile => "Server config empty".to_string(),
            Self::HostUnresolvable(_) => "Invalid server".to_string(),
            Self::TunnelUnavailable(_) => "Reboot required".to_string(),
            other => format!("Service failed: {other}"),
        }
    }

    /// True for failures that only surface as the generic message.
    ///
    /// These are logged with their cause before the session stops.
    pub fn is_generic(&self) -> bool {
        !matches!(
            self,
            Self::ProfileMissing
                | Self::InvalidProfile
                | Self::HostUnresolvable(_)
                | Self::TunnelUnavailable(_)
        )
    }
}
