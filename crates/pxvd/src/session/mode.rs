//! Delivery modes.
//!
//! A delivery mode decides how traffic reaches the local proxy. The
//! controller calls into it at four points: profile validation, extra
//! command-line arguments, notification construction, and the launch step
//! itself.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use pxv_core::Profile;

use super::data::SessionData;
use super::error::SessionError;
use super::notification::{LogNotification, Notification};
use super::SessionSettings;
use crate::acl::AclStore;
use crate::config::PROXY_IDLE_TIMEOUT_SECS;
use crate::config_builder::ConfigBuilder;
use crate::supervisor::ProcessSupervisor;

const SS_LOCAL: &str = "ss-local";
const SS_REDIR: &str = "ss-redir";
const TUN2SOCKS: &str = "tun2socks";

/// Address of the tun2socks virtual interface.
const TUN_NETIF_ADDRESS: &str = "172.19.0.2";

/// Capability interface implemented by each delivery mode.
#[async_trait]
pub trait DeliveryMode: Send + Sync {
    /// Short name used in logs and notifications.
    fn tag(&self) -> &'static str;

    fn validate_profile(&self, profile: &Profile) -> Result<(), SessionError> {
        if profile.is_complete() {
            Ok(())
        } else {
            Err(SessionError::InvalidProfile)
        }
    }

    /// Appends mode-specific arguments to a proxy or plugin command line.
    fn additional_arguments(&self, cmd: Vec<String>) -> Vec<String> {
        cmd
    }

    fn create_notification(&self, profile_name: &str) -> Box<dyn Notification> {
        Box::new(LogNotification::new(self.tag(), profile_name))
    }

    /// Starts the session's processes.
    async fn launch(&self, launcher: &Launcher<'_>) -> Result<(), SessionError>;
}

// ============================================================================
// Launcher
// ============================================================================

/// Everything a delivery mode needs to start processes for one attempt.
pub struct Launcher<'a> {
    pub(crate) data: &'a SessionData,
    pub(crate) settings: &'a SessionSettings,
    pub(crate) builder: &'a ConfigBuilder,
    pub(crate) acl_store: &'a dyn AclStore,
    pub(crate) supervisor: &'a dyn ProcessSupervisor,
    pub(crate) mode: &'a dyn DeliveryMode,
    pub(crate) profile: &'a Profile,
}

impl Launcher<'_> {
    pub fn profile(&self) -> &Profile {
        self.profile
    }

    pub fn settings(&self) -> &SessionSettings {
        self.settings
    }

    pub fn executable(&self, name: &str) -> String {
        self.settings.executable_dir.join(name).display().to_string()
    }

    /// Writes the config artifact and records it on the session.
    pub fn build_config(&self) -> Result<PathBuf, SessionError> {
        let plugin = self.data.plugin();
        let plugin_path = self.data.plugin_path();
        let path = self.builder.build(
            self.profile,
            &plugin,
            plugin_path.as_deref(),
            |cmd| self.mode.additional_arguments(cmd),
        )?;
        self.data.set_config_file(path.clone());
        Ok(path)
    }

    /// The `ss-local` command line for `config`.
    pub fn proxy_command(&self, config: &Path) -> Vec<String> {
        let settings = self.settings;
        let cmd = vec![
            self.executable(SS_LOCAL),
            "-u".to_string(),
            "-b".to_string(),
            settings.listen_address.clone(),
            "-l".to_string(),
            settings.local_port.to_string(),
            "-t".to_string(),
            PROXY_IDLE_TIMEOUT_SECS.to_string(),
            "-S".to_string(),
            settings.stat_path.display().to_string(),
            "-c".to_string(),
            config.display().to_string(),
        ];
        let mut cmd = self.mode.additional_arguments(cmd);

        if self.profile.route.needs_acl() {
            cmd.push("--acl".to_string());
            cmd.push(self.acl_store.path(self.profile.route).display().to_string());
        }
        if self.profile.udpdns {
            cmd.push("-D".to_string());
        }
        if settings.tcp_fast_open {
            cmd.push("--fast-open".to_string());
        }
        cmd
    }

    /// Starts one tracked process.
    pub fn start(&self, argv: Vec<String>) -> Result<u32, SessionError> {
        let program = argv.first().cloned().unwrap_or_default();
        let pid = self.supervisor.start(argv)?;
        debug!(program = %program, pid, "Started process");
        Ok(pid)
    }

    /// Builds the config artifact and launches `ss-local` against it.
    pub fn start_proxy(&self) -> Result<u32, SessionError> {
        let config = self.build_config()?;
        self.start(self.proxy_command(&config))
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.data.config_file()
    }
}

// ============================================================================
// Routed proxy
// ============================================================================

/// Plain local SOCKS proxy; applications route through it explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutedProxyMode;

#[async_trait]
impl DeliveryMode for RoutedProxyMode {
    fn tag(&self) -> &'static str {
        "proxy"
    }

    async fn launch(&self, launcher: &Launcher<'_>) -> Result<(), SessionError> {
        launcher.start_proxy()?;
        Ok(())
    }
}

// ============================================================================
// Tunnel device
// ============================================================================

/// Supplies the tunnel device that captures system traffic.
pub trait TunnelProvider: Send + Sync {
    /// Returns the device name once it is ready.
    fn establish(&self) -> io::Result<String>;
}

/// Uses a pre-configured interface, checking it exists under sysfs.
#[derive(Debug, Clone)]
pub struct StaticTunnelProvider {
    name: String,
    sysfs: PathBuf,
}

impl StaticTunnelProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_sysfs(name, "/sys/class/net")
    }

    pub fn with_sysfs(name: impl Into<String>, sysfs: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            sysfs: sysfs.into(),
        }
    }
}

impl TunnelProvider for StaticTunnelProvider {
    fn establish(&self) -> io::Result<String> {
        let path = self.sysfs.join(&self.name);
        if path.exists() {
            Ok(self.name.clone())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("interface {} not present", self.name),
            ))
        }
    }
}

/// Captures traffic through a tunnel device bridged by `tun2socks`.
pub struct TunnelDeviceMode {
    provider: Arc<dyn TunnelProvider>,
}

impl TunnelDeviceMode {
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl DeliveryMode for TunnelDeviceMode {
    fn tag(&self) -> &'static str {
        "vpn"
    }

    fn additional_arguments(&self, mut cmd: Vec<String>) -> Vec<String> {
        cmd.push("-V".to_string());
        cmd
    }

    async fn launch(&self, launcher: &Launcher<'_>) -> Result<(), SessionError> {
        launcher.start_proxy()?;

        let device = self
            .provider
            .establish()
            .map_err(|e| SessionError::TunnelUnavailable(e.to_string()))?;
        info!(device = %device, "Tunnel device ready");

        let settings = launcher.settings();
        launcher.start(vec![
            launcher.executable(TUN2SOCKS),
            "--netif-ipaddr".to_string(),
            TUN_NETIF_ADDRESS.to_string(),
            "--socks-server-addr".to_string(),
            format!("{}:{}", settings.listen_address, settings.local_port),
            "--tunmtu".to_string(),
            settings.tun_mtu.to_string(),
            "--tundev".to_string(),
            device,
            "--loglevel".to_string(),
            "warning".to_string(),
        ])?;
        Ok(())
    }
}

// ============================================================================
// Transparent proxy
// ============================================================================

/// Local proxy plus an `ss-redir` listener for redirected connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransparentProxyMode;

#[async_trait]
impl DeliveryMode for TransparentProxyMode {
    fn tag(&self) -> &'static str {
        "transproxy"
    }

    async fn launch(&self, launcher: &Launcher<'_>) -> Result<(), SessionError> {
        launcher.start_proxy()?;

        let config = launcher
            .config_path()
            .ok_or_else(|| SessionError::Unexpected("config artifact missing".to_string()))?;
        let settings = launcher.settings();
        launcher.start(vec![
            launcher.executable(SS_REDIR),
            "-u".to_string(),
            "-b".to_string(),
            settings.listen_address.clone(),
            "-l".to_string(),
            settings.transproxy_port.to_string(),
            "-t".to_string(),
            PROXY_IDLE_TIMEOUT_SECS.to_string(),
            "-c".to_string(),
            config.display().to_string(),
        ])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::FileAclStore;
    use crate::storage::StorageState;
    use crate::supervisor::LaunchError;
    use pxv_core::{ProfileId, Route};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        launched: Mutex<Vec<Vec<String>>>,
    }

    impl ProcessSupervisor for Recording {
        fn start(&self, argv: Vec<String>) -> Result<u32, LaunchError> {
            let mut launched = self.launched.lock().unwrap();
            launched.push(argv);
            Ok(launched.len() as u32)
        }

        fn kill_all(&self) {
            self.launched.lock().unwrap().clear();
        }

        fn tracked(&self) -> usize {
            self.launched.lock().unwrap().len()
        }
    }

    struct Fixture {
        _dir: TempDir,
        data: SessionData,
        settings: SessionSettings,
        builder: ConfigBuilder,
        acl: FileAclStore,
        supervisor: Recording,
    }

    impl Fixture {
        fn new(fast_open: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let storage = StorageState::new(dir.path().join("user"), dir.path().join("device"), true);
            let settings = SessionSettings {
                executable_dir: PathBuf::from("/opt/pxv"),
                tcp_fast_open: fast_open,
                stat_path: dir.path().join("stat_main"),
                ..SessionSettings::default()
            };
            Self {
                data: SessionData::new(),
                builder: ConfigBuilder::new(storage, fast_open),
                acl: FileAclStore::new(dir.path().join("acl")),
                supervisor: Recording::default(),
                settings,
                _dir: dir,
            }
        }

        fn launcher<'a>(&'a self, mode: &'a dyn DeliveryMode, profile: &'a Profile) -> Launcher<'a> {
            Launcher {
                data: &self.data,
                settings: &self.settings,
                builder: &self.builder,
                acl_store: &self.acl,
                supervisor: &self.supervisor,
                mode,
                profile,
            }
        }
    }

    fn profile() -> Profile {
        Profile::new(ProfileId::new(1), "1.2.3.4", 8388, "p", "aes-256-gcm")
    }

    #[test]
    fn test_proxy_command_defaults() {
        let fixture = Fixture::new(false);
        let profile = profile();
        let launcher = fixture.launcher(&RoutedProxyMode, &profile);

        let cmd = launcher.proxy_command(Path::new("/tmp/proxy.conf"));
        assert_eq!(cmd[0], "/opt/pxv/ss-local");
        assert!(cmd.windows(2).any(|w| w == ["-t", "600"]));
        assert!(cmd.windows(2).any(|w| w == ["-c", "/tmp/proxy.conf"]));
        assert!(!cmd.contains(&"--acl".to_string()));
        assert!(!cmd.contains(&"-D".to_string()));
        assert!(!cmd.contains(&"--fast-open".to_string()));
    }

    #[test]
    fn test_proxy_command_optional_flags() {
        let fixture = Fixture::new(true);
        let mut profile = profile();
        profile.route = Route::BypassLan;
        profile.udpdns = true;
        let mode = TunnelDeviceMode::new(Arc::new(StaticTunnelProvider::new("tun0")));
        let launcher = fixture.launcher(&mode, &profile);

        let cmd = launcher.proxy_command(Path::new("/tmp/proxy.conf"));
        let acl = fixture.acl.path(Route::BypassLan).display().to_string();
        assert!(cmd.windows(2).any(|w| w == ["--acl".to_string(), acl.clone()]));
        assert!(cmd.contains(&"-V".to_string()));
        assert!(cmd.contains(&"-D".to_string()));
        assert_eq!(cmd.last().map(String::as_str), Some("--fast-open"));
    }

    #[tokio::test]
    async fn test_routed_launch_records_config() {
        let fixture = Fixture::new(false);
        let profile = profile();
        RoutedProxyMode
            .launch(&fixture.launcher(&RoutedProxyMode, &profile))
            .await
            .unwrap();

        let config = fixture.data.config_file().unwrap();
        assert!(config.exists());
        assert_eq!(fixture.supervisor.tracked(), 1);
    }

    #[tokio::test]
    async fn test_transparent_launches_redirector() {
        let fixture = Fixture::new(false);
        let profile = profile();
        TransparentProxyMode
            .launch(&fixture.launcher(&TransparentProxyMode, &profile))
            .await
            .unwrap();

        let launched = fixture.supervisor.launched.lock().unwrap();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[1][0], "/opt/pxv/ss-redir");
    }

    #[tokio::test]
    async fn test_missing_tunnel_is_tunnel_unavailable() {
        let fixture = Fixture::new(false);
        let sysfs = TempDir::new().unwrap();
        let mode = TunnelDeviceMode::new(Arc::new(StaticTunnelProvider::with_sysfs("tun9", sysfs.path())));
        let profile = profile();

        let err = mode.launch(&fixture.launcher(&mode, &profile)).await.unwrap_err();
        assert!(matches!(err, SessionError::TunnelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_tunnel_launches_tun2socks() {
        let fixture = Fixture::new(false);
        let sysfs = TempDir::new().unwrap();
        std::fs::create_dir(sysfs.path().join("tun0")).unwrap();
        let mode = TunnelDeviceMode::new(Arc::new(StaticTunnelProvider::with_sysfs("tun0", sysfs.path())));
        let profile = profile();

        mode.launch(&fixture.launcher(&mode, &profile)).await.unwrap();
        let launched = fixture.supervisor.launched.lock().unwrap();
        assert_eq!(launched[1][0], "/opt/pxv/tun2socks");
        assert!(launched[1].windows(2).any(|w| w == ["--tundev", "tun0"]));
    }

    #[test]
    fn test_default_validation() {
        let mut profile = profile();
        assert!(RoutedProxyMode.validate_profile(&profile).is_ok());
        profile.password.clear();
        assert!(matches!(
            RoutedProxyMode.validate_profile(&profile),
            Err(SessionError::InvalidProfile)
        ));
    }
}
