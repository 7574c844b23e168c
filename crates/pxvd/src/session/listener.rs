//! Teardown listener.
//!
//! While a session is active, a task listens on the daemon's control bus
//! so a reload or close request reaches the controller even when no
//! client connection is involved (e.g. SIGHUP).

use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionController;

const CONTROL_BUS_CAPACITY: usize = 16;

/// Actions published on the control bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Re-read the current profile and restart if running.
    Reload,
    /// Stop the session and release the daemon.
    Close,
    /// The host is going down.
    Shutdown,
}

/// Creates the control bus sender. Listeners subscribe to it.
pub fn control_bus() -> broadcast::Sender<ControlAction> {
    let (tx, _rx) = broadcast::channel(CONTROL_BUS_CAPACITY);
    tx
}

pub(crate) fn spawn_teardown_listener(
    controller: Weak<SessionController>,
    mut actions: broadcast::Receiver<ControlAction>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let action = tokio::select! {
                _ = cancel.cancelled() => break,

                received = actions.recv() => match received {
                    Ok(action) => action,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Teardown listener lagged, control actions dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let Some(controller) = controller.upgrade() else {
                break;
            };
            debug!(?action, "Control action received");
            match action {
                ControlAction::Reload => controller.reload().await,
                ControlAction::Close | ControlAction::Shutdown => controller.stop(true).await,
            }
        }
        debug!("Teardown listener stopped");
    })
}
