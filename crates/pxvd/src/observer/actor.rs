//! Observer actor - owns the registry and serializes every broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Observer failures are logged and never abort a broadcast
//! - Channel send failures are ignored; the receiver may have gone away

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pxv_core::{ProfileId, SessionState, TrafficSample};

use super::commands::{
    BandwidthSource, Observer, ObserverCommand, ObserverCounts, ObserverError, ObserverId,
    ObserverRegistryError,
};

// ============================================================================
// Observer Actor
// ============================================================================

/// The observer actor.
///
/// Owns the registered observers, the bandwidth membership set, and the
/// bandwidth timer. The timer runs exactly while the set is non-empty: the
/// first subscription starts it, removing the last one cancels it.
pub struct ObserverActor {
    receiver: mpsc::Receiver<ObserverCommand>,

    /// Lets the timer task post ticks without keeping the actor alive.
    weak_sender: mpsc::WeakSender<ObserverCommand>,

    observers: HashMap<ObserverId, Arc<dyn Observer>>,
    bandwidth: HashSet<ObserverId>,
    next_id: u64,

    source: Arc<dyn BandwidthSource>,
    tick: Duration,
    timer: Option<CancellationToken>,
    generation: u64,
}

impl ObserverActor {
    pub fn new(
        receiver: mpsc::Receiver<ObserverCommand>,
        weak_sender: mpsc::WeakSender<ObserverCommand>,
        source: Arc<dyn BandwidthSource>,
        tick: Duration,
    ) -> Self {
        Self {
            receiver,
            weak_sender,
            observers: HashMap::new(),
            bandwidth: HashSet::new(),
            next_id: 0,
            source,
            tick,
            timer: None,
            generation: 0,
        }
    }

    /// Runs the actor until every handle is dropped.
    pub async fn run(mut self) {
        debug!("Observer actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        self.stop_timer();
        info!(observers = self.observers.len(), "Observer actor stopped");
    }

    fn handle_command(&mut self, cmd: ObserverCommand) {
        match cmd {
            ObserverCommand::Register {
                observer,
                respond_to,
            } => {
                let id = self.handle_register(observer);
                let _ = respond_to.send(id);
            }
            ObserverCommand::Unregister { id, respond_to } => {
                let removed = self.handle_unregister(id);
                let _ = respond_to.send(removed);
            }
            ObserverCommand::StartBandwidth { id, respond_to } => {
                let result = self.handle_start_bandwidth(id);
                let _ = respond_to.send(result);
            }
            ObserverCommand::StopBandwidth { id, respond_to } => {
                let removed = self.handle_stop_bandwidth(id);
                let _ = respond_to.send(removed);
            }
            ObserverCommand::BroadcastState {
                state,
                profile_name,
                message,
            } => {
                self.broadcast_state(state, &profile_name, message.as_deref());
            }
            ObserverCommand::BroadcastPersisted { profile_id } => {
                self.broadcast_persisted(profile_id);
            }
            ObserverCommand::BandwidthTick { generation } => {
                self.handle_tick(generation);
            }
            ObserverCommand::Counts { respond_to } => {
                let _ = respond_to.send(ObserverCounts {
                    registered: self.observers.len(),
                    bandwidth: self.bandwidth.len(),
                    timer_running: self.timer.is_some(),
                });
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, observer: Arc<dyn Observer>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.insert(id, observer);
        debug!(observer = %id, total = self.observers.len(), "Observer registered");
        id
    }

    fn handle_unregister(&mut self, id: ObserverId) -> bool {
        self.handle_stop_bandwidth(id);
        let removed = self.observers.remove(&id).is_some();
        if removed {
            debug!(observer = %id, total = self.observers.len(), "Observer unregistered");
        }
        removed
    }

    fn handle_start_bandwidth(&mut self, id: ObserverId) -> Result<(), ObserverRegistryError> {
        let observer = self
            .observers
            .get(&id)
            .cloned()
            .ok_or(ObserverRegistryError::UnknownObserver(id))?;

        let was_empty = self.bandwidth.is_empty();
        if !self.bandwidth.insert(id) {
            return Ok(());
        }
        if was_empty {
            self.start_timer();
        }

        if let Some((profile_id, sample)) = self.source.snapshot() {
            if let Err(e) = observer.traffic_updated(profile_id, &sample) {
                Self::log_failure(id, &e);
                if e == ObserverError::Disconnected {
                    self.handle_unregister(id);
                }
            }
        }
        Ok(())
    }

    fn handle_stop_bandwidth(&mut self, id: ObserverId) -> bool {
        let removed = self.bandwidth.remove(&id);
        if removed && self.bandwidth.is_empty() {
            self.stop_timer();
        }
        removed
    }

    fn handle_tick(&mut self, generation: u64) {
        if generation != self.generation || self.bandwidth.is_empty() {
            return;
        }
        if let Some((profile_id, sample)) = self.source.poll() {
            self.broadcast_traffic(profile_id, &sample);
        }
    }

    // ========================================================================
    // Broadcasts
    // ========================================================================

    fn broadcast_state(&mut self, state: SessionState, profile_name: &str, message: Option<&str>) {
        let mut dead = Vec::new();
        for (id, observer) in &self.observers {
            if let Err(e) = observer.state_changed(state, profile_name, message) {
                Self::log_failure(*id, &e);
                if e == ObserverError::Disconnected {
                    dead.push(*id);
                }
            }
        }
        self.prune(dead);
    }

    fn broadcast_traffic(&mut self, profile_id: ProfileId, sample: &TrafficSample) {
        let mut dead = Vec::new();
        for id in &self.bandwidth {
            let Some(observer) = self.observers.get(id) else {
                continue;
            };
            if let Err(e) = observer.traffic_updated(profile_id, sample) {
                Self::log_failure(*id, &e);
                if e == ObserverError::Disconnected {
                    dead.push(*id);
                }
            }
        }
        self.prune(dead);
    }

    fn broadcast_persisted(&mut self, profile_id: ProfileId) {
        let mut dead = Vec::new();
        for id in &self.bandwidth {
            let Some(observer) = self.observers.get(id) else {
                continue;
            };
            if let Err(e) = observer.traffic_persisted(profile_id) {
                Self::log_failure(*id, &e);
                if e == ObserverError::Disconnected {
                    dead.push(*id);
                }
            }
        }
        self.prune(dead);
    }

    fn prune(&mut self, dead: Vec<ObserverId>) {
        for id in dead {
            self.handle_unregister(id);
        }
    }

    fn log_failure(id: ObserverId, error: &ObserverError) {
        match error {
            ObserverError::Disconnected => debug!(observer = %id, "Dropping disconnected observer"),
            ObserverError::Delivery(reason) => {
                warn!(observer = %id, reason = %reason, "Failed to deliver to observer")
            }
        }
    }

    // ========================================================================
    // Bandwidth Timer
    // ========================================================================

    fn start_timer(&mut self) {
        self.stop_timer();
        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        let sender = self.weak_sender.clone();
        let tick = self.tick;

        tokio::spawn({
            let token = token.clone();
            async move {
                let mut ticker = interval_at(Instant::now() + tick, tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(sender) = sender.upgrade() else { break };
                            if sender.send(ObserverCommand::BandwidthTick { generation }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                debug!(generation, "Bandwidth timer stopped");
            }
        });

        debug!(generation, "Bandwidth timer started");
        self.timer = Some(token);
    }

    fn stop_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
    }
}
