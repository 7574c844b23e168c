//! Traffic rate samples.

use serde::{Deserialize, Serialize};

/// A snapshot of current rates and lifetime totals, in bytes and bytes/second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub tx_rate: u64,
    pub rx_rate: u64,
    pub tx_total: u64,
    pub rx_total: u64,
}

impl TrafficSample {
    pub fn is_idle(&self) -> bool {
        self.tx_rate == 0 && self.rx_rate == 0
    }
}
