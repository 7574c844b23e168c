//! Session controller: the proxy session state machine.
//!
//! One controller drives one delivery mode. It turns the current profile
//! into supervised processes, keeps [`SessionData`] current, and reports
//! every transition through the observer registry.
//!
//! # State machine
//!
//! ```text
//!            start                 attempt succeeds
//! Stopped ──────────▶ Connecting ──────────────────▶ Connected
//!    ▲                    │                              │
//!    │                    │ attempt fails                │ stop / reload
//!    │                    ▼                              ▼
//!    └──────────────── Stopping ◀────────────────────────┘
//! ```
//!
//! The start attempt runs on its own task. A stop requested while
//! Connecting is deferred until that attempt resolves; a start or reload
//! requested while Connecting or Stopping is logged and dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pxv_core::{PluginConfiguration, PluginOptions, Profile, ProfileId, Route, SessionState, TrafficSample};

use crate::acl::{AclStore, AclSyncer};
use crate::config::{
    DaemonConfig, BANDWIDTH_TICK, BOOTSTRAP_SENTINEL_HOST, CUSTOM_RULES_FLATTEN_DEPTH,
    DNS_TIMEOUT, STAT_SOCKET_NAME,
};
use crate::config_builder::ConfigBuilder;
use crate::direct_boot::DeviceStore;
use crate::observer::{spawn_observers, BandwidthSource, ObserverHandle};
use crate::plugin::{PluginError, PluginResolver};
use crate::remote::{choose_candidate, BootstrapClient, RemoteConfig};
use crate::resolve::{resolve_host, HostResolver};
use crate::storage::StorageState;
use crate::store::ProfileStore;
use crate::supervisor::ProcessSupervisor;
use crate::traffic::{spawn_stat_listener, TrafficAccountant, TrafficMonitor};

mod data;
mod error;
mod listener;
mod mode;
mod notification;

pub use data::{SessionData, IDLE_PROFILE_NAME};
pub use error::SessionError;
pub use listener::{control_bus, ControlAction};
pub use mode::{
    DeliveryMode, Launcher, RoutedProxyMode, StaticTunnelProvider, TransparentProxyMode,
    TunnelDeviceMode, TunnelProvider,
};
pub use notification::{LogNotification, Notification};

use listener::spawn_teardown_listener;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Wiring
// ============================================================================

/// External collaborators the controller calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ProfileStore>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub resolver: Arc<dyn HostResolver>,
    pub plugins: Arc<dyn PluginResolver>,
    pub acl_store: Arc<dyn AclStore>,
    pub acl_syncer: Arc<dyn AclSyncer>,
    pub bootstrap: Arc<dyn BootstrapClient>,
    pub remote_config: Arc<dyn RemoteConfig>,
    pub device: Arc<DeviceStore>,
    pub storage: StorageState,
}

/// Launch and timing parameters for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub executable_dir: PathBuf,
    pub listen_address: String,
    pub local_port: u16,
    pub transproxy_port: u16,
    pub tcp_fast_open: bool,
    pub tun_mtu: u16,
    /// Host value that triggers the bootstrap exchange.
    pub bootstrap_sentinel: String,
    pub dns_timeout: Duration,
    pub flatten_depth: usize,
    pub stat_path: PathBuf,
}

impl SessionSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            executable_dir: config.executable_dir.clone(),
            listen_address: config.listen_address.clone(),
            local_port: config.local_port,
            transproxy_port: config.transproxy_port,
            tcp_fast_open: config.tcp_fast_open,
            tun_mtu: config.tun_mtu,
            stat_path: config.stat_path(),
            ..Self::default()
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            executable_dir: PathBuf::from("/usr/bin"),
            listen_address: "127.0.0.1".to_string(),
            local_port: 1080,
            transproxy_port: 8200,
            tcp_fast_open: false,
            tun_mtu: 1500,
            bootstrap_sentinel: BOOTSTRAP_SENTINEL_HOST.to_string(),
            dns_timeout: DNS_TIMEOUT,
            flatten_depth: CUSTOM_RULES_FLATTEN_DEPTH,
            stat_path: std::env::temp_dir().join(STAT_SOCKET_NAME),
        }
    }
}

/// Bandwidth view over the session for the observer timer.
struct SessionBandwidth {
    data: Arc<SessionData>,
    monitor: Arc<TrafficMonitor>,
}

impl SessionBandwidth {
    fn connected_id(&self) -> Option<ProfileId> {
        if self.data.state() == SessionState::Connected {
            self.data.profile_id()
        } else {
            None
        }
    }
}

impl BandwidthSource for SessionBandwidth {
    fn poll(&self) -> Option<(ProfileId, TrafficSample)> {
        let id = self.connected_id()?;
        self.monitor.fresh_sample().map(|sample| (id, sample))
    }

    fn snapshot(&self) -> Option<(ProfileId, TrafficSample)> {
        let id = self.connected_id()?;
        Some((id, self.monitor.sample()))
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct SessionController {
    mode: Arc<dyn DeliveryMode>,
    collab: Collaborators,
    settings: SessionSettings,
    data: Arc<SessionData>,
    monitor: Arc<TrafficMonitor>,
    observers: ObserverHandle,
    accountant: TrafficAccountant,
    builder: ConfigBuilder,
    bus: broadcast::Sender<ControlAction>,
    /// Serializes entry into Connecting with teardown.
    transition: tokio::sync::Mutex<()>,
    stop_requested: AtomicBool,
    stop_full: AtomicBool,
    deferred_message: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl SessionController {
    /// Creates a controller and spawns its observer registry.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        mode: Arc<dyn DeliveryMode>,
        collab: Collaborators,
        settings: SessionSettings,
        bus: broadcast::Sender<ControlAction>,
    ) -> Arc<Self> {
        let data = Arc::new(SessionData::new());
        let monitor = Arc::new(TrafficMonitor::new());
        let bandwidth = Arc::new(SessionBandwidth {
            data: Arc::clone(&data),
            monitor: Arc::clone(&monitor),
        });
        let observers = spawn_observers(bandwidth, BANDWIDTH_TICK);
        let accountant = TrafficAccountant::new(
            Arc::clone(&collab.store),
            Arc::clone(&collab.device),
            collab.storage.clone(),
            Arc::clone(&monitor),
            observers.clone(),
        );
        let builder = ConfigBuilder::new(collab.storage.clone(), settings.tcp_fast_open);

        Arc::new(Self {
            mode,
            collab,
            settings,
            data,
            monitor,
            observers,
            accountant,
            builder,
            bus,
            transition: tokio::sync::Mutex::new(()),
            stop_requested: AtomicBool::new(false),
            stop_full: AtomicBool::new(false),
            deferred_message: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.data.state()
    }

    pub fn data(&self) -> &Arc<SessionData> {
        &self.data
    }

    pub fn observers(&self) -> &ObserverHandle {
        &self.observers
    }

    pub fn accountant(&self) -> &TrafficAccountant {
        &self.accountant
    }

    pub fn mode_tag(&self) -> &'static str {
        self.mode.tag()
    }

    /// Cancelled once a stop requests full shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Starts a session from the current profile.
    ///
    /// Returns once the session is Connecting (or has failed validation);
    /// the rest of the attempt runs on its own task. A start that arrives
    /// while another start or a teardown holds the transition is dropped.
    pub async fn start(self: &Arc<Self>) {
        let Ok(guard) = self.transition.try_lock() else {
            warn!(mode = self.mode.tag(), state = %self.data.state(), "Start requested mid-transition, ignoring");
            return;
        };

        let state = self.data.state();
        if state != SessionState::Stopped {
            warn!(mode = self.mode.tag(), state = %state, "Start requested in illegal state, ignoring");
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stop_full.store(false, Ordering::SeqCst);
        *self.deferred_message.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let mut profile = match self.collab.store.current() {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                self.data.set_notification(self.mode.create_notification(""));
                self.teardown_locked(true, Some(SessionError::ProfileMissing.user_message()))
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load current profile");
                let message = SessionError::from(e).user_message();
                self.teardown_locked(true, Some(message)).await;
                return;
            }
        };

        if let Err(e) = self.mode.validate_profile(&profile) {
            info!(profile_id = %profile.id, error = %e, "Profile rejected");
            self.teardown_locked(true, Some(e.user_message())).await;
            return;
        }

        // Host may be rewritten by bootstrap or DNS; keep the name stable.
        let name = profile.formatted_name();
        profile.name = Some(name.clone());
        self.data.set_profile(Some(profile.clone()));

        self.monitor.reset();
        self.start_stat_listener();
        self.register_listener();
        self.data.set_notification(self.mode.create_notification(&name));
        self.change_state(SessionState::Connecting, None).await;
        drop(guard);

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run_attempt(profile).await });
    }

    async fn run_attempt(self: Arc<Self>, profile: Profile) {
        let profile_id = profile.id;
        match self.connect(profile).await {
            Ok(()) => {
                if self.stop_requested.load(Ordering::SeqCst) {
                    info!(profile_id = %profile_id, "Honouring stop requested while connecting");
                    let full = self.stop_full.load(Ordering::SeqCst);
                    let message = self
                        .deferred_message
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    self.teardown(full, message).await;
                }
            }
            Err(e) => {
                if e.is_generic() {
                    error!(mode = self.mode.tag(), profile_id = %profile_id, error = %e, "Session failed to start");
                } else {
                    warn!(mode = self.mode.tag(), profile_id = %profile_id, error = %e, "Session failed to start");
                }
                self.teardown(true, Some(e.user_message())).await;
            }
        }
    }

    /// The start sequence proper, from bootstrap to Connected.
    async fn connect(&self, mut profile: Profile) -> Result<(), SessionError> {
        if profile.host == self.settings.bootstrap_sentinel {
            let candidates = self.collab.bootstrap.fetch_candidates().await?;
            let chosen = choose_candidate(&candidates)?;
            chosen.apply_to(&mut profile);
            info!(profile_id = %profile.id, host = %profile.host, "Bootstrap supplied server");
        }

        if profile.route == Route::CustomRules {
            let acl_store = self.collab.acl_store.as_ref();
            let rules = acl_store
                .custom_rules()?
                .flatten(self.settings.flatten_depth, acl_store);
            let path = acl_store.save(Route::CustomRules, &rules)?;
            debug!(path = %path.display(), rules = rules.rule_count(), "Custom rules flattened");
        }

        let plugin = match profile.plugin.as_deref() {
            Some(spec) if !spec.trim().is_empty() => PluginConfiguration::parse(spec)
                .map_err(PluginError::from)?
                .selected_options(),
            _ => PluginOptions::default(),
        };
        let plugin_path = self.collab.plugins.resolve(&plugin)?;
        self.data.set_plugin(plugin, plugin_path);

        self.kill_processes().await?;

        if !profile.has_numeric_host() {
            let address = resolve_host(
                Arc::clone(&self.collab.resolver),
                &profile.host,
                self.settings.dns_timeout,
            )
            .await?;
            profile.host = address.to_string();
        }
        self.data.set_profile(Some(profile.clone()));

        let launcher = Launcher {
            data: &self.data,
            settings: &self.settings,
            builder: &self.builder,
            acl_store: self.collab.acl_store.as_ref(),
            supervisor: self.collab.supervisor.as_ref(),
            mode: self.mode.as_ref(),
            profile: &profile,
        };
        self.mode.launch(&launcher).await?;

        if profile.route.is_managed() {
            self.collab.acl_syncer.schedule(profile.route);
        }
        self.collab.remote_config.fetch();

        self.data.set_connected_since(Some(Utc::now()));
        self.change_state(SessionState::Connected, None).await;
        Ok(())
    }

    async fn kill_processes(&self) -> Result<(), SessionError> {
        let supervisor = Arc::clone(&self.collab.supervisor);
        tokio::task::spawn_blocking(move || supervisor.kill_all())
            .await
            .map_err(|e| SessionError::Unexpected(format!("process cleanup failed: {e}")))
    }

    fn start_stat_listener(&self) {
        let token = CancellationToken::new();
        match spawn_stat_listener(&self.settings.stat_path, Arc::clone(&self.monitor), token.clone()) {
            Ok(_) => self.data.set_stat(token),
            Err(e) => warn!(
                path = %self.settings.stat_path.display(),
                error = %e,
                "Failed to bind stat socket, traffic will not be sampled"
            ),
        }
    }

    fn register_listener(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if self.data.register_listener(token.clone()) {
            spawn_teardown_listener(Arc::downgrade(self), self.bus.subscribe(), token);
        }
    }

    // ========================================================================
    // Stop / Reload
    // ========================================================================

    /// Stops the session. `shutdown` also releases the hosting daemon.
    ///
    /// Safe from any state and under concurrent calls. While Connecting the
    /// stop is deferred until the attempt resolves.
    pub async fn stop(&self, shutdown: bool) {
        self.request_stop(shutdown, None).await;
    }

    /// Stops the session and waits until it is Stopped, at most `limit`.
    ///
    /// Returns false if the session was still running when `limit` passed,
    /// which happens when a deferred stop outlives its start attempt.
    pub async fn stop_and_wait(&self, shutdown: bool, limit: Duration) -> bool {
        self.stop(shutdown).await;
        let settled = async {
            while self.data.state() != SessionState::Stopped {
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(limit, settled).await.is_ok()
    }

    async fn request_stop(&self, shutdown: bool, message: Option<String>) {
        if self.data.state() == SessionState::Connecting {
            if message.is_some() {
                *self.deferred_message.lock().unwrap_or_else(PoisonError::into_inner) = message.clone();
            }
            self.stop_full.fetch_or(shutdown, Ordering::SeqCst);
            self.stop_requested.store(true, Ordering::SeqCst);
            if self.data.state() == SessionState::Connecting {
                info!(mode = self.mode.tag(), "Stop requested while connecting, deferring");
                return;
            }
        }
        self.teardown(shutdown, message).await;
    }

    /// Re-reads the current profile and restarts the session with it.
    pub async fn reload(self: &Arc<Self>) {
        let profile = match self.collab.store.current() {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                self.request_stop(true, Some(SessionError::ProfileMissing.user_message()))
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to load current profile");
                self.request_stop(true, Some(SessionError::from(e).user_message()))
                    .await;
                return;
            }
        };
        if let Err(e) = self.mode.validate_profile(&profile) {
            self.request_stop(true, Some(e.user_message())).await;
            return;
        }

        match self.data.state() {
            SessionState::Stopped => self.start().await,
            SessionState::Connected => {
                self.stop(false).await;
                self.start().await;
            }
            other => {
                warn!(mode = self.mode.tag(), state = %other, "Reload requested in illegal state, ignoring");
            }
        }
    }

    async fn teardown(&self, shutdown: bool, message: Option<String>) {
        let _guard = self.transition.lock().await;
        self.teardown_locked(shutdown, message).await;
    }

    async fn teardown_locked(&self, shutdown: bool, message: Option<String>) {
        if self.data.state() == SessionState::Stopped {
            let Some(message) = message else {
                debug!(mode = self.mode.tag(), "Already stopped");
                return;
            };
            if let Some(notification) = self.data.take_notification() {
                notification.destroy();
            }
            self.change_state(SessionState::Stopped, Some(message)).await;
            if shutdown {
                self.shutdown.cancel();
            }
            self.data.set_profile(None);
            return;
        }

        self.change_state(SessionState::Stopping, None).await;

        // Processes must be gone before their config is removed.
        let supervisor = Arc::clone(&self.collab.supervisor);
        if let Err(e) = tokio::task::spawn_blocking(move || supervisor.kill_all()).await {
            error!(error = %e, "Process cleanup task failed");
        }

        self.data.unregister_listener();

        if let Some(path) = self.data.take_config_file() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed proxy config"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove proxy config"),
            }
        }

        if let Some(notification) = self.data.take_notification() {
            notification.destroy();
        }

        if let Some(id) = self.data.profile_id() {
            let (tx, rx) = self.monitor.totals();
            if tx > 0 || rx > 0 {
                if let Err(e) = self.accountant.record_delta(id, tx, rx).await {
                    warn!(profile_id = %id, error = %e, "Failed to persist traffic");
                }
            }
        }

        self.monitor.reset();
        self.data.cancel_stat();
        self.data.set_connected_since(None);

        self.change_state(SessionState::Stopped, message).await;

        if shutdown {
            self.shutdown.cancel();
        }
        self.data.set_profile(None);
    }

    /// Broadcasts `next`, then commits it.
    async fn change_state(&self, next: SessionState, message: Option<String>) {
        let current = self.data.state();
        if current == next && message.is_none() {
            return;
        }
        self.observers
            .broadcast_state(next, self.data.profile_name(), message.clone())
            .await;
        self.data.set_state(next);
        info!(
            mode = self.mode.tag(),
            from = %current,
            to = %next,
            message = message.as_deref().unwrap_or(""),
            "Session state changed"
        );
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("mode", &self.mode.tag())
            .field("data", &self.data)
            .finish()
    }
}
