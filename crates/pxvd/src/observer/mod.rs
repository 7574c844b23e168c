//! Observer registry using the Actor pattern.
//!
//! Every broadcast and every registration change goes through one task,
//! so observers see events in a consistent order and a failing observer
//! can never interrupt delivery to the others.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │SessionController │────▶│  ObserverActor  │────▶│   Observers     │
//! └──────────────────┘     └─────────────────┘     └─────────────────┘
//!                             ▲          │
//!              BandwidthTick  │          │ start / cancel
//!                             │          ▼
//!                          ┌─────────────────┐
//!                          │ bandwidth timer │
//!                          └─────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;

pub use actor::ObserverActor;
pub use commands::{
    BandwidthSource, Observer, ObserverCommand, ObserverCounts, ObserverError, ObserverId,
    ObserverRegistryError,
};
pub use handle::ObserverHandle;

const COMMAND_BUFFER: usize = 100;

/// Spawns the observer actor and returns a handle to it.
///
/// `tick` is the bandwidth broadcast cadence. The actor stops once every
/// handle is dropped.
pub fn spawn_observers(source: Arc<dyn BandwidthSource>, tick: Duration) -> ObserverHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = ObserverActor::new(cmd_rx, cmd_tx.downgrade(), source, tick);
    tokio::spawn(actor.run());
    ObserverHandle::new(cmd_tx)
}
