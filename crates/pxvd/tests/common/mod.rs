//! Shared fakes for the pxvd integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use pxv_core::{Profile, ProfileId, Route, SessionState, TrafficSample};
use pxvd::acl::{AclStore, AclSyncer, FileAclStore};
use pxvd::direct_boot::DeviceStore;
use pxvd::observer::{Observer, ObserverError};
use pxvd::plugin::{PluginError, PluginResolver};
use pxvd::remote::{BootstrapClient, BootstrapError, RemoteConfig, ServerCandidate};
use pxvd::resolve::{HostResolver, ResolveError};
use pxvd::session::{
    control_bus, Collaborators, ControlAction, DeliveryMode, RoutedProxyMode, SessionController,
    SessionSettings,
};
use pxvd::storage::StorageState;
use pxvd::store::{JsonProfileStore, ProfileStore, StoreError};
use pxvd::supervisor::{LaunchError, ProcessSupervisor};

/// Upper bound for waiting on any single event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Collaborator fakes
// ============================================================================

/// Records launched command lines instead of spawning processes.
#[derive(Default)]
pub struct FakeSupervisor {
    pub launched: Mutex<Vec<Vec<String>>>,
    tracked: AtomicUsize,
    pub kills: AtomicUsize,
}

impl FakeSupervisor {
    pub fn launched(&self) -> Vec<Vec<String>> {
        self.launched.lock().unwrap().clone()
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn start(&self, argv: Vec<String>) -> Result<u32, LaunchError> {
        if argv.is_empty() {
            return Err(LaunchError::EmptyCommand);
        }
        self.launched.lock().unwrap().push(argv);
        Ok(self.tracked.fetch_add(1, Ordering::SeqCst) as u32 + 100)
    }

    fn kill_all(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.tracked.store(0, Ordering::SeqCst);
    }

    fn tracked(&self) -> usize {
        self.tracked.load(Ordering::SeqCst)
    }
}

/// In-memory profile store with a switchable lock.
#[derive(Default)]
pub struct MemoryStore {
    profiles: Mutex<BTreeMap<ProfileId, Profile>>,
    current: Mutex<Option<ProfileId>>,
}

impl MemoryStore {
    pub fn with_current(profile: Profile) -> Self {
        let store = Self::default();
        store.put(profile, true);
        store
    }

    pub fn put(&self, profile: Profile, select: bool) {
        if select {
            *self.current.lock().unwrap() = Some(profile.id);
        }
        self.profiles.lock().unwrap().insert(profile.id, profile);
    }

    pub fn clear_current(&self) {
        *self.current.lock().unwrap() = None;
    }
}

impl ProfileStore for MemoryStore {
    fn get(&self, id: ProfileId) -> Result<Option<Profile>, StoreError> {
        Ok(self.profiles.lock().unwrap().get(&id).cloned())
    }

    fn update(&self, profile: &Profile) -> Result<(), StoreError> {
        let mut profiles = self.profiles.lock().unwrap();
        match profiles.get_mut(&profile.id) {
            Some(slot) => {
                *slot = profile.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(profile.id)),
        }
    }

    fn current(&self) -> Result<Option<Profile>, StoreError> {
        let current = *self.current.lock().unwrap();
        Ok(current.and_then(|id| self.profiles.lock().unwrap().get(&id).cloned()))
    }
}

/// Resolver answering from a table; unknown hosts hang forever.
#[derive(Default)]
pub struct FakeResolver {
    pub answers: Mutex<BTreeMap<String, Vec<IpAddr>>>,
}

impl FakeResolver {
    pub fn answering(host: &str, addr: &str) -> Self {
        let resolver = Self::default();
        resolver
            .answers
            .lock()
            .unwrap()
            .insert(host.to_string(), vec![addr.parse().unwrap()]);
        resolver
    }
}

#[async_trait]
impl HostResolver for FakeResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let answer = self.answers.lock().unwrap().get(host).cloned();
        match answer {
            Some(addrs) => Ok(addrs),
            None => std::future::pending().await,
        }
    }
}

/// Resolver that answers only once the test opens the gate.
pub struct GatedResolver {
    pub gate: Arc<tokio::sync::Notify>,
    addr: IpAddr,
}

impl GatedResolver {
    pub fn new(addr: &str) -> (Self, Arc<tokio::sync::Notify>) {
        let gate = Arc::new(tokio::sync::Notify::new());
        let resolver = Self {
            gate: Arc::clone(&gate),
            addr: addr.parse().unwrap(),
        };
        (resolver, gate)
    }
}

#[async_trait]
impl HostResolver for GatedResolver {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.gate.notified().await;
        Ok(vec![self.addr])
    }
}

pub struct NoPlugins;

impl PluginResolver for NoPlugins {
    fn resolve(
        &self,
        options: &pxv_core::PluginOptions,
    ) -> Result<Option<PathBuf>, PluginError> {
        if options.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PathBuf::from("/bin").join(&options.id)))
        }
    }
}

#[derive(Default)]
pub struct RecordingSyncer {
    pub scheduled: Mutex<Vec<Route>>,
}

impl AclSyncer for RecordingSyncer {
    fn schedule(&self, route: Route) {
        self.scheduled.lock().unwrap().push(route);
    }
}

pub struct FixedBootstrap(pub Vec<ServerCandidate>);

#[async_trait]
impl BootstrapClient for FixedBootstrap {
    async fn fetch_candidates(&self) -> Result<Vec<ServerCandidate>, BootstrapError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct CountingRemoteConfig {
    pub fetches: AtomicUsize,
}

impl RemoteConfig for CountingRemoteConfig {
    fn fetch(&self) {
        self.fetches.fetch_add(1, Ordering::SeqCst);
    }

    fn proxy_url(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Observers
// ============================================================================

/// One event seen by a [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    State(SessionState, Option<String>),
    Traffic(ProfileId, TrafficSample),
    Persisted(ProfileId),
}

/// Forwards every event to a channel the test reads from.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Seen>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Observer for ChannelObserver {
    fn state_changed(
        &self,
        state: SessionState,
        _profile_name: &str,
        message: Option<&str>,
    ) -> Result<(), ObserverError> {
        self.tx
            .send(Seen::State(state, message.map(str::to_string)))
            .map_err(|_| ObserverError::Disconnected)
    }

    fn traffic_updated(
        &self,
        profile_id: ProfileId,
        sample: &TrafficSample,
    ) -> Result<(), ObserverError> {
        self.tx
            .send(Seen::Traffic(profile_id, *sample))
            .map_err(|_| ObserverError::Disconnected)
    }

    fn traffic_persisted(&self, profile_id: ProfileId) -> Result<(), ObserverError> {
        self.tx
            .send(Seen::Persisted(profile_id))
            .map_err(|_| ObserverError::Disconnected)
    }
}

/// Fails every delivery without disconnecting.
pub struct FailingObserver;

impl Observer for FailingObserver {
    fn state_changed(
        &self,
        _state: SessionState,
        _profile_name: &str,
        _message: Option<&str>,
    ) -> Result<(), ObserverError> {
        Err(ObserverError::Delivery("boom".to_string()))
    }

    fn traffic_updated(
        &self,
        _profile_id: ProfileId,
        _sample: &TrafficSample,
    ) -> Result<(), ObserverError> {
        Err(ObserverError::Delivery("boom".to_string()))
    }

    fn traffic_persisted(&self, _profile_id: ProfileId) -> Result<(), ObserverError> {
        Err(ObserverError::Delivery("boom".to_string()))
    }
}

/// Waits for the next state event, skipping traffic events.
pub async fn next_state(rx: &mut mpsc::UnboundedReceiver<Seen>) -> (SessionState, Option<String>) {
    next_state_within(rx, EVENT_TIMEOUT).await
}

pub async fn next_state_within(
    rx: &mut mpsc::UnboundedReceiver<Seen>,
    limit: Duration,
) -> (SessionState, Option<String>) {
    loop {
        let seen = tokio::time::timeout(limit, rx.recv())
            .await
            .expect("timed out waiting for state event")
            .expect("observer channel closed");
        if let Seen::State(state, message) = seen {
            return (state, message);
        }
    }
}

/// Collects state events until `until` is seen.
pub async fn states_until(
    rx: &mut mpsc::UnboundedReceiver<Seen>,
    until: SessionState,
) -> Vec<(SessionState, Option<String>)> {
    let mut seen = Vec::new();
    loop {
        let event = next_state(rx).await;
        let done = event.0 == until;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn profile(id: i64, host: &str) -> Profile {
    Profile::new(ProfileId::new(id), host, 8388, "p", "aes-256-gcm")
}

/// A controller wired to fakes, with its collaborators kept for inspection.
pub struct Harness {
    pub dir: TempDir,
    pub controller: Arc<SessionController>,
    pub supervisor: Arc<FakeSupervisor>,
    pub store: Arc<MemoryStore>,
    pub syncer: Arc<RecordingSyncer>,
    pub remote: Arc<CountingRemoteConfig>,
    pub storage: StorageState,
    pub bus: tokio::sync::broadcast::Sender<ControlAction>,
    /// Set when the controller reads profiles from disk.
    pub json_store: Option<Arc<JsonProfileStore>>,
}

pub struct HarnessBuilder {
    store: MemoryStore,
    resolver: Arc<dyn HostResolver>,
    mode: Arc<dyn DeliveryMode>,
    bootstrap: Vec<ServerCandidate>,
    json_profile: Option<Profile>,
    locked: bool,
}

impl HarnessBuilder {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            resolver: Arc::new(FakeResolver::default()),
            mode: Arc::new(RoutedProxyMode),
            bootstrap: Vec::new(),
            json_profile: None,
            locked: false,
        }
    }

    /// Backs the controller with a `JsonProfileStore` holding `profile`.
    pub fn json_store(mut self, profile: Profile) -> Self {
        self.json_profile = Some(profile);
        self
    }

    /// Locks user storage once the store is populated.
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn resolver(mut self, resolver: impl HostResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn mode(mut self, mode: Arc<dyn DeliveryMode>) -> Self {
        self.mode = mode;
        self
    }

    pub fn bootstrap(mut self, candidates: Vec<ServerCandidate>) -> Self {
        self.bootstrap = candidates;
        self
    }

    pub fn build(self) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = StorageState::new(dir.path().join("user"), dir.path().join("device"), true);
        let supervisor = Arc::new(FakeSupervisor::default());
        let store = Arc::new(self.store);
        let syncer = Arc::new(RecordingSyncer::default());
        let remote = Arc::new(CountingRemoteConfig::default());
        let acl_store: Arc<dyn AclStore> = Arc::new(FileAclStore::new(dir.path().join("acl")));
        let json_store = self.json_profile.map(|profile| {
            let json = Arc::new(JsonProfileStore::new(
                dir.path().join("user").join("profiles.json"),
                storage.clone(),
            ));
            json.upsert(profile, true).unwrap();
            json
        });
        let profile_store: Arc<dyn ProfileStore> = match &json_store {
            Some(json) => Arc::clone(json) as Arc<dyn ProfileStore>,
            None => Arc::clone(&store) as Arc<dyn ProfileStore>,
        };
        if self.locked {
            storage.lock();
        }

        let collab = Collaborators {
            store: profile_store,
            supervisor: Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
            resolver: self.resolver,
            plugins: Arc::new(NoPlugins),
            acl_store,
            acl_syncer: Arc::clone(&syncer) as Arc<dyn AclSyncer>,
            bootstrap: Arc::new(FixedBootstrap(self.bootstrap)),
            remote_config: Arc::clone(&remote) as Arc<dyn RemoteConfig>,
            device: Arc::new(DeviceStore::new(&dir.path().join("device"))),
            storage: storage.clone(),
        };
        let settings = SessionSettings {
            executable_dir: PathBuf::from("/opt/pxv"),
            stat_path: dir.path().join("device").join("stat_main"),
            ..SessionSettings::default()
        };
        let bus = control_bus();
        let controller = SessionController::new(self.mode, collab, settings, bus.clone());

        Harness {
            dir,
            controller,
            supervisor,
            store,
            syncer,
            remote,
            storage,
            bus,
            json_store,
        }
    }
}

impl Harness {
    /// Registers a channel observer on the controller's registry.
    pub async fn observe(&self) -> mpsc::UnboundedReceiver<Seen> {
        let (observer, rx) = ChannelObserver::new();
        self.controller.observers().register(observer).await.unwrap();
        rx
    }
}
