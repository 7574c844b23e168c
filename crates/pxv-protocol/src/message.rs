//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use chrono::{DateTime, Utc};
use pxv_core::{ProfileId, SessionState, TrafficSample};
use serde::{Deserialize, Serialize};

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Query current state and profile name
    GetState,

    /// Start a session with the current profile
    Start,

    /// Stop the running session
    Stop {
        /// Also terminate the hosting daemon's session runtime
        #[serde(default)]
        shutdown: bool,
    },

    /// Re-read the current profile and restart if connected
    Reload,

    /// Receive state changes on this connection
    RegisterCallback,

    UnregisterCallback,

    /// Receive per-second traffic updates (requires a registered callback)
    StartBandwidth,

    StopBandwidth,

    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

impl MessageType {
    /// Short name used in `accepted` acknowledgements and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::GetState => "get_state",
            Self::Start => "start",
            Self::Stop { .. } => "stop",
            Self::Reload => "reload",
            Self::RegisterCallback => "register_callback",
            Self::UnregisterCallback => "unregister_callback",
            Self::StartBandwidth => "start_bandwidth",
            Self::StopBandwidth => "stop_bandwidth",
            Self::Ping { .. } => "ping",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a client message with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn get_state() -> Self {
        Self::new(MessageType::GetState)
    }

    pub fn start() -> Self {
        Self::new(MessageType::Start)
    }

    pub fn stop(shutdown: bool) -> Self {
        Self::new(MessageType::Stop { shutdown })
    }

    pub fn reload() -> Self {
        Self::new(MessageType::Reload)
    }

    pub fn register_callback() -> Self {
        Self::new(MessageType::RegisterCallback)
    }

    pub fn unregister_callback() -> Self {
        Self::new(MessageType::UnregisterCallback)
    }

    pub fn start_bandwidth() -> Self {
        Self::new(MessageType::StartBandwidth)
    }

    pub fn stop_bandwidth() -> Self {
        Self::new(MessageType::StopBandwidth)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Reply to `get_state`
    State {
        state: SessionState,
        profile_name: String,
        /// When the current session reached Connected
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connected_since: Option<DateTime<Utc>>,
    },

    /// A command was accepted for processing
    Accepted { command: String },

    /// Broadcast to registered callbacks
    StateChanged {
        state: SessionState,
        profile_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Broadcast to bandwidth listeners once per second while connected
    TrafficUpdated {
        profile_id: ProfileId,
        #[serde(flatten)]
        sample: TrafficSample,
    },

    /// Traffic counters were written to the profile store
    TrafficPersisted { profile_id: ProfileId },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn state(
        state: SessionState,
        profile_name: impl Into<String>,
        connected_since: Option<DateTime<Utc>>,
    ) -> Self {
        Self::State {
            state,
            profile_name: profile_name.into(),
            connected_since,
        }
    }

    pub fn accepted(command: &str) -> Self {
        Self::Accepted {
            command: command.to_string(),
        }
    }

    pub fn state_changed(
        state: SessionState,
        profile_name: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Self::StateChanged {
            state,
            profile_name: profile_name.into(),
            message,
        }
    }

    pub fn traffic_updated(profile_id: ProfileId, sample: TrafficSample) -> Self {
        Self::TrafficUpdated { profile_id, sample }
    }

    pub fn traffic_persisted(profile_id: ProfileId) -> Self {
        Self::TrafficPersisted { profile_id }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_serialization() {
        let json = serde_json::to_string(&ClientMessage::stop(true)).unwrap();
        assert!(json.contains("\"type\":\"stop\""));
        assert!(json.contains("\"shutdown\":true"));
        assert!(json.contains("\"protocol_version\""));
    }

    #[test]
    fn test_stop_shutdown_defaults_to_false() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"stop"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.message, MessageType::Stop { shutdown: false });
    }

    #[test]
    fn test_unit_variants_parse() {
        let json = r#"{"protocol_version":{"major":1,"minor":0},"type":"start_bandwidth"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.message, MessageType::StartBandwidth);
        assert_eq!(parsed.message.name(), "start_bandwidth");
    }

    #[test]
    fn test_traffic_update_is_flat() {
        let msg = DaemonMessage::traffic_updated(
            ProfileId::new(3),
            TrafficSample {
                tx_rate: 1,
                rx_rate: 2,
                tx_total: 10,
                rx_total: 20,
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "traffic_updated");
        assert_eq!(value["profile_id"], 3);
        assert_eq!(value["rx_total"], 20);

        let back: DaemonMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_state_carries_connected_since() {
        let since = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 12, 0, 0).unwrap();
        let msg = DaemonMessage::state(SessionState::Connected, "Tokyo", Some(since));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "state");
        assert_eq!(value["connected_since"], "2024-03-01T12:00:00Z");
        assert_eq!(serde_json::from_value::<DaemonMessage>(value).unwrap(), msg);

        let idle = DaemonMessage::state(SessionState::Stopped, "Idle", None);
        let json = serde_json::to_string(&idle).unwrap();
        assert!(!json.contains("connected_since"));
    }

    #[test]
    fn test_state_changed_omits_missing_message() {
        let msg = DaemonMessage::state_changed(SessionState::Connected, "Tokyo", None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"state\":\"connected\""));
        assert!(!json.contains("message"));
    }
}
