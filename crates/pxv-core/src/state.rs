//! Session lifecycle states.

use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a proxy session.
///
/// `Idle` exists for presentation layers only; the session controller
/// never produces it. The numeric values are stable and used on the wire
/// by clients that prefer integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Stopping = 3,
    #[default]
    Stopped = 4,
}

impl SessionState {
    /// Converts a stored discriminant back into a state.
    ///
    /// Unknown values fall back to `Stopped`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    /// Returns the stable numeric discriminant.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a short human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Returns true while a session attempt owns resources.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for SessionState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(DomainError::invalid(
                "state",
                other,
                "idle|connecting|connected|stopping|stopped",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_are_stable() {
        assert_eq!(SessionState::Idle.as_u8(), 0);
        assert_eq!(SessionState::Connecting.as_u8(), 1);
        assert_eq!(SessionState::Connected.as_u8(), 2);
        assert_eq!(SessionState::Stopping.as_u8(), 3);
        assert_eq!(SessionState::Stopped.as_u8(), 4);
    }

    #[test]
    fn test_from_u8_roundtrip_and_fallback() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Stopping,
            SessionState::Stopped,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(SessionState::from_u8(42), SessionState::Stopped);
    }

    #[test]
    fn test_default_is_stopped() {
        assert_eq!(SessionState::default(), SessionState::Stopped);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&SessionState::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
    }

    #[test]
    fn test_is_active() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Connected.is_active());
        assert!(!SessionState::Stopping.is_active());
        assert!(!SessionState::Stopped.is_active());
    }
}
