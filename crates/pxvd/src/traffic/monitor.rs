//! Passive traffic sampler.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use pxv_core::TrafficSample;

#[derive(Debug)]
struct MonitorState {
    tx_total: u64,
    rx_total: u64,
    tx_rate: u64,
    rx_rate: u64,
    tx_last: u64,
    rx_last: u64,
    last_sample: Instant,
    dirty: bool,
}

impl MonitorState {
    fn new() -> Self {
        Self {
            tx_total: 0,
            rx_total: 0,
            tx_rate: 0,
            rx_rate: 0,
            tx_last: 0,
            rx_last: 0,
            last_sample: Instant::now(),
            dirty: false,
        }
    }

    fn sample(&self) -> TrafficSample {
        TrafficSample {
            tx_rate: self.tx_rate,
            rx_rate: self.rx_rate,
            tx_total: self.tx_total,
            rx_total: self.rx_total,
        }
    }
}

/// Lifetime totals reported by the proxy, and rates derived from them.
///
/// Totals only move forward between resets: a report lower than the
/// current total is ignored.
#[derive(Debug)]
pub struct TrafficMonitor {
    state: Mutex<MonitorState>,
}

impl TrafficMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records cumulative totals for the current session.
    pub fn update(&self, tx_total: u64, rx_total: u64) {
        let mut state = self.lock();
        if tx_total > state.tx_total {
            state.tx_total = tx_total;
            state.dirty = true;
        }
        if rx_total > state.rx_total {
            state.rx_total = rx_total;
            state.dirty = true;
        }
    }

    /// Recomputes rates since the previous call. Returns true if they changed.
    ///
    /// Rates drop to zero on the first call after traffic stops.
    pub fn update_rate(&self) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.last_sample).as_millis() as u64;
        if elapsed_ms == 0 {
            return false;
        }

        let mut updated = false;
        if state.dirty {
            state.tx_rate = state.tx_total.saturating_sub(state.tx_last).saturating_mul(1000) / elapsed_ms;
            state.rx_rate = state.rx_total.saturating_sub(state.rx_last).saturating_mul(1000) / elapsed_ms;
            state.tx_last = state.tx_total;
            state.rx_last = state.rx_total;
            state.dirty = false;
            updated = true;
        } else {
            if state.tx_rate != 0 {
                state.tx_rate = 0;
                updated = true;
            }
            if state.rx_rate != 0 {
                state.rx_rate = 0;
                updated = true;
            }
        }
        state.last_sample = now;
        updated
    }

    /// Updates rates and returns a sample only if they changed.
    pub fn fresh_sample(&self) -> Option<TrafficSample> {
        if self.update_rate() {
            Some(self.sample())
        } else {
            None
        }
    }

    pub fn sample(&self) -> TrafficSample {
        self.lock().sample()
    }

    /// Lifetime `(tx, rx)` totals for the current session.
    pub fn totals(&self) -> (u64, u64) {
        let state = self.lock();
        (state.tx_total, state.rx_total)
    }

    pub fn reset(&self) {
        *self.lock() = MonitorState::new();
    }
}

impl Default for TrafficMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_per_second() {
        let monitor = TrafficMonitor::new();
        tokio::time::advance(Duration::from_secs(2)).await;
        monitor.update(4000, 2000);

        assert!(monitor.update_rate());
        let sample = monitor.sample();
        assert_eq!(sample.tx_rate, 2000);
        assert_eq!(sample.rx_rate, 1000);
        assert_eq!(sample.tx_total, 4000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_drops_to_zero_when_idle() {
        let monitor = TrafficMonitor::new();
        tokio::time::advance(Duration::from_secs(1)).await;
        monitor.update(100, 100);
        assert!(monitor.update_rate());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(monitor.update_rate());
        assert!(monitor.sample().is_idle());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!monitor.update_rate());
        assert!(monitor.fresh_sample().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_totals_never_decrease() {
        let monitor = TrafficMonitor::new();
        monitor.update(100, 50);
        monitor.update(90, 60);
        assert_eq!(monitor.totals(), (100, 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_zeroes_everything() {
        let monitor = TrafficMonitor::new();
        tokio::time::advance(Duration::from_secs(1)).await;
        monitor.update(100, 50);
        monitor.update_rate();

        monitor.reset();
        assert_eq!(monitor.sample(), TrafficSample::default());
    }
}
