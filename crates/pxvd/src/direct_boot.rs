//! Device-storage fallback for traffic accounting.
//!
//! While user storage is locked the profile store rejects writes. Traffic
//! deltas are staged here instead, in a small JSON record under device
//! storage, and merged into the live profiles once storage unlocks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pxv_core::ProfileId;

use crate::storage::StorageState;
use crate::store::{ProfileStore, StoreError};

const RECORD_NAME: &str = "direct_boot.json";

/// Traffic staged for one profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedTraffic {
    pub tx: u64,
    pub rx: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceRecord {
    #[serde(default)]
    dirty: bool,
    #[serde(default)]
    staged: BTreeMap<ProfileId, StagedTraffic>,
}

/// Staged traffic record in device storage.
pub struct DeviceStore {
    path: PathBuf,
    lock: Mutex<()>,
    listening: AtomicBool,
}

impl DeviceStore {
    pub fn new(device_dir: &Path) -> Self {
        Self {
            path: device_dir.join(RECORD_NAME),
            lock: Mutex::new(()),
            listening: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a delta to the staged record and marks it dirty.
    pub fn stage(&self, id: ProfileId, tx: u64, rx: u64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.read()?;
        let entry = record.staged.entry(id).or_default();
        entry.tx = entry.tx.saturating_add(tx);
        entry.rx = entry.rx.saturating_add(rx);
        record.dirty = true;
        self.write(&record)?;
        debug!(profile_id = %id, tx, rx, "Staged traffic in device storage");
        Ok(())
    }

    /// Returns the staged traffic for a profile, if any.
    pub fn staged(&self, id: ProfileId) -> Result<Option<StagedTraffic>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.staged.get(&id).copied())
    }

    pub fn is_dirty(&self) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.dirty)
    }

    /// Merges staged deltas into the live profiles and clears the record.
    ///
    /// Entries for deleted profiles are dropped. Returns the number of
    /// profiles updated. On error the record is left intact, minus the
    /// entries already merged.
    pub fn flush_into(&self, store: &dyn ProfileStore) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = self.read()?;
        if !record.dirty {
            return Ok(0);
        }

        let mut merged = 0;
        while let Some((id, traffic)) = record.staged.pop_first() {
            let result = match store.get(id) {
                Ok(Some(mut profile)) => {
                    profile.add_traffic(traffic.tx, traffic.rx);
                    store.update(&profile).map(|()| true)
                }
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => merged += 1,
                Ok(false) => debug!(profile_id = %id, "Dropping staged traffic for deleted profile"),
                Err(e) => {
                    record.staged.insert(id, traffic);
                    self.write(&record)?;
                    return Err(e);
                }
            }
        }

        record.dirty = false;
        self.write(&record)?;
        Ok(merged)
    }

    /// Flushes staged traffic once user storage unlocks.
    ///
    /// At most one listener is pending at a time; later calls are no-ops
    /// until it fires.
    pub fn listen_for_unlock(self: &Arc<Self>, storage: StorageState, store: Arc<dyn ProfileStore>) {
        if self.listening.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            storage.wait_unlocked().await;
            let flusher = Arc::clone(&this);
            let result =
                tokio::task::spawn_blocking(move || flusher.flush_into(store.as_ref())).await;
            match result {
                Ok(Ok(count)) => info!(profiles = count, "Flushed staged traffic after unlock"),
                Ok(Err(e)) => warn!(error = %e, "Failed to flush staged traffic"),
                Err(e) => warn!(error = %e, "Staged traffic flush task failed"),
            }
            this.listening.store(false, Ordering::Release);
        });
    }

    fn read(&self) -> Result<DeviceRecord, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| StoreError::Parse {
                path: self.path.clone(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeviceRecord::default()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string(record).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&self.path, json).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonProfileStore;
    use pxv_core::Profile;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, unlocked: bool) -> (Arc<DeviceStore>, Arc<JsonProfileStore>, StorageState) {
        let storage = StorageState::new(dir.path().join("user"), dir.path().join("device"), true);
        let store = Arc::new(JsonProfileStore::new(
            dir.path().join("user/profiles.json"),
            storage.clone(),
        ));
        store
            .upsert(Profile::new(ProfileId::new(1), "h", 1, "p", "m"), true)
            .unwrap();
        if !unlocked {
            storage.lock();
        }
        let device = Arc::new(DeviceStore::new(storage.device_dir()));
        (device, store, storage)
    }

    #[test]
    fn test_stage_accumulates() {
        let dir = TempDir::new().unwrap();
        let (device, _, _) = setup(&dir, false);
        device.stage(ProfileId::new(1), 10, 20).unwrap();
        device.stage(ProfileId::new(1), 1, 2).unwrap();
        assert_eq!(
            device.staged(ProfileId::new(1)).unwrap(),
            Some(StagedTraffic { tx: 11, rx: 22 })
        );
        assert!(device.is_dirty().unwrap());
    }

    #[test]
    fn test_flush_merges_and_clears() {
        let dir = TempDir::new().unwrap();
        let (device, store, storage) = setup(&dir, false);
        device.stage(ProfileId::new(1), 10, 20).unwrap();
        device.stage(ProfileId::new(9), 5, 5).unwrap();

        assert!(matches!(device.flush_into(store.as_ref()), Err(StoreError::Locked)));
        assert_eq!(
            device.staged(ProfileId::new(1)).unwrap(),
            Some(StagedTraffic { tx: 10, rx: 20 })
        );

        storage.unlock();
        assert_eq!(device.flush_into(store.as_ref()).unwrap(), 1);
        let profile = store.get(ProfileId::new(1)).unwrap().unwrap();
        assert_eq!((profile.tx, profile.rx), (10, 20));
        assert!(!device.is_dirty().unwrap());
        assert!(device.staged(ProfileId::new(9)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listen_for_unlock_flushes_once_unlocked() {
        let dir = TempDir::new().unwrap();
        let (device, store, storage) = setup(&dir, false);
        device.stage(ProfileId::new(1), 7, 3).unwrap();

        device.listen_for_unlock(storage.clone(), store.clone());
        device.listen_for_unlock(storage.clone(), store.clone());
        storage.unlock();

        for _ in 0..100 {
            if !device.is_dirty().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let profile = store.get(ProfileId::new(1)).unwrap().unwrap();
        assert_eq!((profile.tx, profile.rx), (7, 3));
    }
}
