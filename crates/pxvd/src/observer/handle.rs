//! Client interface for interacting with the ObserverActor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `ObserverRegistryError::ChannelClosed` or
//! logged; nothing here panics.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use pxv_core::{ProfileId, SessionState};

use super::commands::{
    Observer, ObserverCommand, ObserverCounts, ObserverId, ObserverRegistryError,
};

/// Cheap-to-clone handle to the observer actor.
#[derive(Clone)]
pub struct ObserverHandle {
    sender: mpsc::Sender<ObserverCommand>,
}

impl ObserverHandle {
    pub fn new(sender: mpsc::Sender<ObserverCommand>) -> Self {
        Self { sender }
    }

    /// Registers an observer for state changes.
    pub async fn register(
        &self,
        observer: Arc<dyn Observer>,
    ) -> Result<ObserverId, ObserverRegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ObserverCommand::Register {
                observer,
                respond_to: tx,
            })
            .await
            .map_err(|_| ObserverRegistryError::ChannelClosed)?;
        rx.await.map_err(|_| ObserverRegistryError::ChannelClosed)
    }

    /// Unregisters an observer, revoking its bandwidth subscription first.
    ///
    /// Returns `Ok(false)` if it was not registered.
    pub async fn unregister(&self, id: ObserverId) -> Result<bool, ObserverRegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ObserverCommand::Unregister { id, respond_to: tx })
            .await
            .map_err(|_| ObserverRegistryError::ChannelClosed)?;
        rx.await.map_err(|_| ObserverRegistryError::ChannelClosed)
    }

    /// Subscribes a registered observer to bandwidth updates.
    ///
    /// # Errors
    ///
    /// - `ObserverRegistryError::UnknownObserver` if `id` is not registered
    /// - `ObserverRegistryError::ChannelClosed` if the actor has shut down
    pub async fn start_bandwidth(&self, id: ObserverId) -> Result<(), ObserverRegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ObserverCommand::StartBandwidth { id, respond_to: tx })
            .await
            .map_err(|_| ObserverRegistryError::ChannelClosed)?;
        rx.await.map_err(|_| ObserverRegistryError::ChannelClosed)?
    }

    pub async fn stop_bandwidth(&self, id: ObserverId) -> Result<bool, ObserverRegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ObserverCommand::StopBandwidth { id, respond_to: tx })
            .await
            .map_err(|_| ObserverRegistryError::ChannelClosed)?;
        rx.await.map_err(|_| ObserverRegistryError::ChannelClosed)
    }

    /// Queues a state broadcast. Delivery order matches call order.
    pub async fn broadcast_state(
        &self,
        state: SessionState,
        profile_name: String,
        message: Option<String>,
    ) {
        let cmd = ObserverCommand::BroadcastState {
            state,
            profile_name,
            message,
        };
        if self.sender.send(cmd).await.is_err() {
            debug!(state = %state, "Observer actor gone, state broadcast dropped");
        }
    }

    /// Queues a traffic-persisted broadcast to bandwidth observers.
    pub async fn broadcast_persisted(&self, profile_id: ProfileId) {
        let cmd = ObserverCommand::BroadcastPersisted { profile_id };
        if self.sender.send(cmd).await.is_err() {
            debug!(profile_id = %profile_id, "Observer actor gone, persisted broadcast dropped");
        }
    }

    pub async fn counts(&self) -> Result<ObserverCounts, ObserverRegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ObserverCommand::Counts { respond_to: tx })
            .await
            .map_err(|_| ObserverRegistryError::ChannelClosed)?;
        rx.await.map_err(|_| ObserverRegistryError::ChannelClosed)
    }
}
