//! Observer actor commands, errors, and the observer capability.
//!
//! - `Observer`: what a registered party must be able to receive
//! - `ObserverCommand`: commands sent to the actor
//! - `ObserverRegistryError`: errors returned through the handle

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use pxv_core::{ProfileId, SessionState, TrafficSample};

// ============================================================================
// Observer
// ============================================================================

/// Identity of a registered observer, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);

impl ObserverId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// A party interested in session events.
///
/// Calls are made from the registry's single task, in event order, and
/// must not block.
pub trait Observer: Send + Sync {
    fn state_changed(
        &self,
        state: SessionState,
        profile_name: &str,
        message: Option<&str>,
    ) -> Result<(), ObserverError>;

    fn traffic_updated(
        &self,
        profile_id: ProfileId,
        sample: &TrafficSample,
    ) -> Result<(), ObserverError>;

    fn traffic_persisted(&self, profile_id: ProfileId) -> Result<(), ObserverError>;
}

/// Delivery failures reported by an observer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserverError {
    /// The observer is gone; the registry drops it.
    #[error("Observer disconnected")]
    Disconnected,

    /// A single delivery failed; the observer stays registered.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Supplies traffic samples to the bandwidth timer.
pub trait BandwidthSource: Send + Sync {
    /// Returns a sample if the session is connected and rates changed since
    /// the last poll.
    fn poll(&self) -> Option<(ProfileId, TrafficSample)>;

    /// Returns the current sample if the session is connected.
    fn snapshot(&self) -> Option<(ProfileId, TrafficSample)>;
}

// ============================================================================
// Commands
// ============================================================================

/// Counts reported by [`ObserverCommand::Counts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverCounts {
    pub registered: usize,
    pub bandwidth: usize,
    pub timer_running: bool,
}

/// Commands sent to the observer actor.
pub enum ObserverCommand {
    Register {
        observer: Arc<dyn Observer>,
        respond_to: oneshot::Sender<ObserverId>,
    },

    /// Revokes bandwidth membership first. Responds `false` if unknown.
    Unregister {
        id: ObserverId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Adds a registered observer to the bandwidth set and sends it one
    /// sample immediately if connected.
    StartBandwidth {
        id: ObserverId,
        respond_to: oneshot::Sender<Result<(), ObserverRegistryError>>,
    },

    /// Responds `false` if the observer was not in the bandwidth set.
    StopBandwidth {
        id: ObserverId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Fire-and-forget state broadcast to every registered observer.
    BroadcastState {
        state: SessionState,
        profile_name: String,
        message: Option<String>,
    },

    /// Fire-and-forget persisted-traffic broadcast to bandwidth observers.
    BroadcastPersisted { profile_id: ProfileId },

    /// Sent by the bandwidth timer. Ticks from a cancelled timer carry a
    /// stale generation and are ignored.
    BandwidthTick { generation: u64 },

    Counts {
        respond_to: oneshot::Sender<ObserverCounts>,
    },
}

impl fmt::Debug for ObserverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { .. } => f.write_str("Register"),
            Self::Unregister { id, .. } => write!(f, "Unregister({id})"),
            Self::StartBandwidth { id, .. } => write!(f, "StartBandwidth({id})"),
            Self::StopBandwidth { id, .. } => write!(f, "StopBandwidth({id})"),
            Self::BroadcastState { state, .. } => write!(f, "BroadcastState({state})"),
            Self::BroadcastPersisted { profile_id } => write!(f, "BroadcastPersisted({profile_id})"),
            Self::BandwidthTick { generation } => write!(f, "BandwidthTick({generation})"),
            Self::Counts { .. } => f.write_str("Counts"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur in observer registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserverRegistryError {
    #[error("Unknown observer: {0}")]
    UnknownObserver(ObserverId),

    #[error("Observer registry channel closed")]
    ChannelClosed,
}
