//! Protocol versioning for safe upgrades.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version for client-daemon communication.
///
/// Major bumps are breaking; minor bumps only add message variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Current protocol version.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidFormat(s.to_string());
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }

    /// Versions are compatible when their major components match.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Returns an error describing the mismatch, if any.
    pub fn check(&self, expected: &ProtocolVersion) -> Result<(), VersionError> {
        if self.is_compatible_with(expected) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: self.to_string(),
                expected: expected.to_string(),
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}
