//! Session notifications.

use tracing::info;

/// A user-visible indicator that a session is active.
///
/// Created when a session starts, destroyed during teardown.
pub trait Notification: Send + Sync {
    fn destroy(&self);
}

/// Notification that only logs. Used where no UI surface exists.
#[derive(Debug)]
pub struct LogNotification {
    mode: &'static str,
    profile_name: String,
}

impl LogNotification {
    pub fn new(mode: &'static str, profile_name: impl Into<String>) -> Self {
        let profile_name = profile_name.into();
        info!(mode, profile = %profile_name, "Session notification shown");
        Self { mode, profile_name }
    }
}

impl Notification for LogNotification {
    fn destroy(&self) {
        info!(mode = self.mode, profile = %self.profile_name, "Session notification cleared");
    }
}
