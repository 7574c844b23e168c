//! Traffic persistence.

use std::sync::Arc;

use tracing::{debug, info};

use pxv_core::{ProfileId, TrafficSample};

use super::TrafficMonitor;
use crate::direct_boot::DeviceStore;
use crate::observer::ObserverHandle;
use crate::storage::StorageState;
use crate::store::{ProfileStore, StoreError};

/// Applies traffic deltas to the persisted profile.
///
/// Always re-fetches the profile by id before adding, so concurrent edits
/// to other fields are never overwritten by a stale working copy.
pub struct TrafficAccountant {
    store: Arc<dyn ProfileStore>,
    device: Arc<DeviceStore>,
    storage: StorageState,
    monitor: Arc<TrafficMonitor>,
    observers: ObserverHandle,
}

impl TrafficAccountant {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        device: Arc<DeviceStore>,
        storage: StorageState,
        monitor: Arc<TrafficMonitor>,
        observers: ObserverHandle,
    ) -> Self {
        Self {
            store,
            device,
            storage,
            monitor,
            observers,
        }
    }

    /// Adds `tx`/`rx` to the stored profile's counters.
    ///
    /// On success, bandwidth observers get a traffic-persisted event. While
    /// storage is locked the delta is staged in device storage and flushed
    /// on unlock. Any other store failure is returned.
    pub async fn record_delta(&self, id: ProfileId, tx: u64, rx: u64) -> Result<(), StoreError> {
        match self.persist(id, tx, rx) {
            Ok(true) => {
                debug!(profile_id = %id, tx, rx, "Persisted traffic");
                self.observers.broadcast_persisted(id).await;
                Ok(())
            }
            Ok(false) => {
                debug!(profile_id = %id, "Profile gone, traffic discarded");
                Ok(())
            }
            Err(StoreError::Locked) => {
                info!(profile_id = %id, tx, rx, "Storage locked, staging traffic on device");
                self.device.stage(id, tx, rx)?;
                self.device
                    .listen_for_unlock(self.storage.clone(), Arc::clone(&self.store));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&self, id: ProfileId, tx: u64, rx: u64) -> Result<bool, StoreError> {
        let Some(mut profile) = self.store.get(id)? else {
            return Ok(false);
        };
        profile.add_traffic(tx, rx);
        self.store.update(&profile)?;
        Ok(true)
    }

    /// Updates rates and returns a sample if they changed. No persistence.
    pub fn rate(&self) -> Option<TrafficSample> {
        self.monitor.fresh_sample()
    }

    pub fn monitor(&self) -> &Arc<TrafficMonitor> {
        &self.monitor
    }
}
