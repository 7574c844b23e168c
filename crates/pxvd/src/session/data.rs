//! Per-session mutable record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use pxv_core::{PluginOptions, Profile, ProfileId, SessionState};

use super::notification::Notification;

/// Display name used when no profile is active.
pub const IDLE_PROFILE_NAME: &str = "Idle";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the controller, its workers, and readers.
///
/// The controller is the only writer. Every field is behind an atomic or a
/// lock so readers always see the latest committed value.
pub struct SessionData {
    state: AtomicU8,
    profile: RwLock<Option<Profile>>,
    plugin: RwLock<PluginOptions>,
    plugin_path: RwLock<Option<PathBuf>>,
    config_file: Mutex<Option<PathBuf>>,
    notification: Mutex<Option<Box<dyn Notification>>>,
    listener: Mutex<Option<CancellationToken>>,
    stat: Mutex<Option<CancellationToken>>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl SessionData {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Stopped.as_u8()),
            profile: RwLock::new(None),
            plugin: RwLock::new(PluginOptions::default()),
            plugin_path: RwLock::new(None),
            config_file: Mutex::new(None),
            notification: Mutex::new(None),
            listener: Mutex::new(None),
            stat: Mutex::new(None),
            connected_since: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Working copy of the active profile.
    pub fn profile(&self) -> Option<Profile> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_profile(&self, profile: Option<Profile>) {
        *self.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    pub fn profile_id(&self) -> Option<ProfileId> {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.id)
    }

    /// Display name of the active profile, or `Idle`.
    pub fn profile_name(&self) -> String {
        self.profile
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Profile::formatted_name)
            .unwrap_or_else(|| IDLE_PROFILE_NAME.to_string())
    }

    pub fn plugin(&self) -> PluginOptions {
        self.plugin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn plugin_path(&self) -> Option<PathBuf> {
        self.plugin_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_plugin(&self, options: PluginOptions, path: Option<PathBuf>) {
        *self.plugin.write().unwrap_or_else(PoisonError::into_inner) = options;
        *self.plugin_path.write().unwrap_or_else(PoisonError::into_inner) = path;
    }

    /// Path of the generated config artifact, if one exists.
    pub fn config_file(&self) -> Option<PathBuf> {
        lock(&self.config_file).clone()
    }

    pub(crate) fn set_config_file(&self, path: PathBuf) {
        *lock(&self.config_file) = Some(path);
    }

    pub(crate) fn take_config_file(&self) -> Option<PathBuf> {
        lock(&self.config_file).take()
    }

    pub(crate) fn set_notification(&self, notification: Box<dyn Notification>) {
        *lock(&self.notification) = Some(notification);
    }

    pub(crate) fn take_notification(&self) -> Option<Box<dyn Notification>> {
        lock(&self.notification).take()
    }

    pub fn has_notification(&self) -> bool {
        lock(&self.notification).is_some()
    }

    /// Whether the teardown listener is registered.
    pub fn listener_registered(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// Stores the listener's token unless one is already registered.
    ///
    /// Returns false when a listener was already registered.
    pub(crate) fn register_listener(&self, token: CancellationToken) -> bool {
        let mut slot = lock(&self.listener);
        if slot.is_some() {
            return false;
        }
        *slot = Some(token);
        true
    }

    pub(crate) fn unregister_listener(&self) {
        if let Some(token) = lock(&self.listener).take() {
            token.cancel();
        }
    }

    pub(crate) fn set_stat(&self, token: CancellationToken) {
        if let Some(previous) = lock(&self.stat).replace(token) {
            previous.cancel();
        }
    }

    pub(crate) fn cancel_stat(&self) {
        if let Some(token) = lock(&self.stat).take() {
            token.cancel();
        }
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        *lock(&self.connected_since)
    }

    pub(crate) fn set_connected_since(&self, at: Option<DateTime<Utc>>) {
        *lock(&self.connected_since) = at;
    }
}

impl Default for SessionData {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData")
            .field("state", &self.state())
            .field("profile", &self.profile().map(|p| p.id))
            .field("config_file", &self.config_file())
            .field("listener_registered", &self.listener_registered())
            .finish()
    }
}
