//! Locked/unlocked user storage.
//!
//! User storage may be unavailable early after boot. Until it unlocks,
//! anything sensitive goes to device-level storage and profile writes
//! fail with [`crate::store::StoreError::Locked`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::NO_BACKUP_DIR;

/// Shared view of storage lock state. Cheap to clone.
#[derive(Clone)]
pub struct StorageState {
    unlocked: Arc<watch::Sender<bool>>,
    user_dir: PathBuf,
    device_dir: PathBuf,
}

impl StorageState {
    pub fn new(user_dir: impl Into<PathBuf>, device_dir: impl Into<PathBuf>, unlocked: bool) -> Self {
        let (tx, _rx) = watch::channel(unlocked);
        Self {
            unlocked: Arc::new(tx),
            user_dir: user_dir.into(),
            device_dir: device_dir.into(),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        *self.unlocked.borrow()
    }

    /// Marks user storage unlocked and wakes every waiter.
    pub fn unlock(&self) {
        if !self.unlocked.send_replace(true) {
            info!(user_dir = %self.user_dir.display(), "User storage unlocked");
        }
    }

    pub fn lock(&self) {
        self.unlocked.send_replace(false);
    }

    /// Resolves once user storage is unlocked.
    pub async fn wait_unlocked(&self) {
        let mut rx = self.unlocked.subscribe();
        // The sender lives as long as `self`, so this only fails on shutdown.
        let _ = rx.wait_for(|unlocked| *unlocked).await;
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// Directory for files that must not end up in backups.
    ///
    /// Lives in user storage once unlocked, otherwise in device storage.
    pub fn no_backup_dir(&self) -> PathBuf {
        let base = if self.is_unlocked() {
            &self.user_dir
        } else {
            &self.device_dir
        };
        base.join(NO_BACKUP_DIR)
    }
}

impl std::fmt::Debug for StorageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageState")
            .field("unlocked", &self.is_unlocked())
            .field("user_dir", &self.user_dir)
            .field("device_dir", &self.device_dir)
            .finish()
    }
}
