//! Persistent profile storage.
//!
//! The session controller only needs three operations, so the store is a
//! narrow synchronous trait. `JsonProfileStore` keeps every profile in a
//! single JSON document in user storage, and mirrors the selected profile
//! into device storage so a session can start before user storage unlocks.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use pxv_core::{Profile, ProfileId};

use crate::storage::StorageState;

/// Device-storage copy of the selected profile.
pub const DEVICE_PROFILE_NAME: &str = "device_profile.json";

/// Load/update access to persisted profiles.
pub trait ProfileStore: Send + Sync {
    /// Loads a profile by id. `Ok(None)` if it was deleted.
    fn get(&self, id: ProfileId) -> Result<Option<Profile>, StoreError>;

    /// Replaces the stored profile with the same id.
    fn update(&self, profile: &Profile) -> Result<(), StoreError>;

    /// Loads the profile selected for the next session.
    ///
    /// Implementations with a device-level copy serve it while user
    /// storage is locked instead of failing with [`StoreError::Locked`].
    fn current(&self) -> Result<Option<Profile>, StoreError>;
}

/// Errors that can occur accessing the profile store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// User storage is not yet unlocked. Recoverable once it unlocks.
    #[error("Profile storage is locked")]
    Locked,

    #[error("Profile storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt profile storage at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Profile not found: {0}")]
    NotFound(ProfileId),
}

/// On-disk layout of [`JsonProfileStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileDocument {
    #[serde(default)]
    pub current: Option<ProfileId>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Profile store backed by one JSON file in user storage.
pub struct JsonProfileStore {
    path: PathBuf,
    storage: StorageState,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>, storage: StorageState) -> Self {
        Self {
            path: path.into(),
            storage,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the selected profile is mirrored in device storage.
    pub fn device_copy_path(&self) -> PathBuf {
        self.storage.device_dir().join(DEVICE_PROFILE_NAME)
    }

    /// Inserts or replaces a profile, optionally selecting it.
    pub fn upsert(&self, profile: Profile, select: bool) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read()?;
        let id = profile.id;
        match doc.profiles.iter_mut().find(|p| p.id == id) {
            Some(existing) => *existing = profile,
            None => doc.profiles.push(profile),
        }
        if select {
            doc.current = Some(id);
        }
        self.write(&doc)
    }

    /// Selects the profile used by the next session.
    pub fn select(&self, id: Option<ProfileId>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read()?;
        doc.current = id;
        self.write(&doc)
    }

    fn ensure_unlocked(&self) -> Result<(), StoreError> {
        if self.storage.is_unlocked() {
            Ok(())
        } else {
            Err(StoreError::Locked)
        }
    }

    fn read(&self) -> Result<ProfileDocument, StoreError> {
        self.ensure_unlocked()?;
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Profile storage missing, starting empty");
                return Ok(ProfileDocument::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn write(&self, doc: &ProfileDocument) -> Result<(), StoreError> {
        self.ensure_unlocked()?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(doc).map_err(|e| StoreError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        // Write-then-rename so a crash never leaves a truncated document.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        if let Err(e) = self.mirror_current(doc) {
            warn!(path = %self.device_copy_path().display(), error = %e, "Failed to mirror current profile");
        }
        Ok(())
    }

    /// Keeps the device copy in step with the selected profile.
    fn mirror_current(&self, doc: &ProfileDocument) -> std::io::Result<()> {
        let path = self.device_copy_path();
        let selected = doc
            .current
            .and_then(|id| doc.profiles.iter().find(|p| p.id == id));
        let Some(profile) = selected else {
            return match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(profile)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)
    }

    /// Reads the device copy. `Ok(None)` if nothing was ever selected.
    fn read_device_copy(&self) -> Result<Option<Profile>, StoreError> {
        let path = self.device_copy_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Parse {
                path,
                message: e.to_string(),
            })
    }
}

impl ProfileStore for JsonProfileStore {
    fn get(&self, id: ProfileId) -> Result<Option<Profile>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.profiles.into_iter().find(|p| p.id == id))
    }

    fn update(&self, profile: &Profile) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read()?;
        let slot = doc
            .profiles
            .iter_mut()
            .find(|p| p.id == profile.id)
            .ok_or(StoreError::NotFound(profile.id))?;
        *slot = profile.clone();
        self.write(&doc)
    }

    fn current(&self) -> Result<Option<Profile>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.storage.is_unlocked() {
            debug!(path = %self.device_copy_path().display(), "Storage locked, reading device profile");
            return self.read_device_copy();
        }
        let doc = self.read()?;
        Ok(doc
            .current
            .and_then(|id| doc.profiles.into_iter().find(|p| p.id == id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, unlocked: bool) -> (JsonProfileStore, StorageState) {
        let storage = StorageState::new(dir.path(), dir.path().join("device"), unlocked);
        (
            JsonProfileStore::new(dir.path().join("profiles.json"), storage.clone()),
            storage,
        )
    }

    fn profile(id: i64) -> Profile {
        Profile::new(ProfileId::new(id), "1.2.3.4", 8388, "p", "aes-256-gcm")
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir, true);
        assert!(store.current().unwrap().is_none());
        assert!(store.get(ProfileId::new(1)).unwrap().is_none());
    }

    #[test]
    fn test_upsert_select_and_update() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir, true);
        store.upsert(profile(1), true).unwrap();
        store.upsert(profile(2), false).unwrap();

        assert_eq!(store.current().unwrap().map(|p| p.id), Some(ProfileId::new(1)));

        let mut p = store.get(ProfileId::new(2)).unwrap().unwrap();
        p.tx = 99;
        store.update(&p).unwrap();
        assert_eq!(store.get(ProfileId::new(2)).unwrap().unwrap().tx, 99);
    }

    #[test]
    fn test_update_unknown_profile_fails() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir, true);
        let err = store.update(&profile(5)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == ProfileId::new(5)));
    }

    #[test]
    fn test_locked_storage_rejects_access() {
        let dir = TempDir::new().unwrap();
        let (store, storage) = store(&dir, false);
        assert!(store.current().unwrap().is_none());
        assert!(matches!(store.get(ProfileId::new(1)), Err(StoreError::Locked)));
        assert!(matches!(store.update(&profile(1)), Err(StoreError::Locked)));
        assert!(matches!(store.upsert(profile(1), true), Err(StoreError::Locked)));

        storage.unlock();
        assert!(store.current().unwrap().is_none());
    }

    #[test]
    fn test_locked_storage_serves_device_copy() {
        let dir = TempDir::new().unwrap();
        let (store, storage) = store(&dir, true);
        store.upsert(profile(1), false).unwrap();
        store.upsert(profile(2), true).unwrap();
        assert!(store.device_copy_path().starts_with(dir.path().join("device")));

        storage.lock();
        let current = store.current().unwrap().unwrap();
        assert_eq!(current.id, ProfileId::new(2));
        assert_eq!(current.host, "1.2.3.4");
        assert!(matches!(store.get(ProfileId::new(2)), Err(StoreError::Locked)));

        storage.unlock();
        store.select(Some(ProfileId::new(1))).unwrap();
        storage.lock();
        assert_eq!(store.current().unwrap().map(|p| p.id), Some(ProfileId::new(1)));

        storage.unlock();
        store.select(None).unwrap();
        assert!(!store.device_copy_path().exists());
        storage.lock();
        assert!(store.current().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir, true);
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.current(), Err(StoreError::Parse { .. })));
    }
}
