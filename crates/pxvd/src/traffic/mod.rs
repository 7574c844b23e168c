//! Traffic sampling and accounting.
//!
//! - `monitor` - passive sampler of lifetime totals and per-second rates
//! - `stat_socket` - Unix listener fed by the proxy with cumulative totals
//! - `accountant` - persists deltas against the live profile, with a
//!   device-storage fallback while user storage is locked

mod accountant;
mod monitor;
mod stat_socket;

pub use accountant::TrafficAccountant;
pub use monitor::TrafficMonitor;
pub use stat_socket::{spawn_stat_listener, STAT_RECORD_LEN};
