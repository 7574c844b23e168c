//! Daemon configuration.
//!
//! Loaded from `$PXV_CONFIG`, else `<config_dir>/pxv/pxvd.toml`. A missing
//! file yields defaults; every field is optional in TOML.
//!
//! ```toml
//! mode = "proxy"
//! local_port = 1080
//! tcp_fast_open = true
//! acl_sync_url = "https://example.com/acl"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Profile host that triggers remote credential replacement before connecting.
pub const BOOTSTRAP_SENTINEL_HOST: &str = "198.199.101.152";

/// Idle timeout handed to the proxy executable (`-t`).
pub const PROXY_IDLE_TIMEOUT_SECS: u64 = 600;

/// Upper bound on a single hostname resolution.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// How long daemon shutdown waits for an in-flight session to stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Maximum `#IMPORT` nesting when flattening custom rules.
pub const CUSTOM_RULES_FLATTEN_DEPTH: usize = 10;

/// Bandwidth broadcast cadence.
pub const BANDWIDTH_TICK: Duration = Duration::from_secs(1);

/// Generated proxy configuration file name.
pub const CONFIG_FILE_NAME: &str = "proxy.conf";

/// Directory excluded from backups, under user or device storage.
pub const NO_BACKUP_DIR: &str = "no_backup";

/// Stat socket name, under device storage.
pub const STAT_SOCKET_NAME: &str = "stat_main";

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/pxvd.sock";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PXV_CONFIG";

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "PXV_SOCKET";

// ============================================================================
// Service Mode
// ============================================================================

/// How proxied traffic reaches the local proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Applications connect to the SOCKS listener directly.
    #[default]
    Proxy,
    /// Traffic is captured by a tunnel device.
    Vpn,
    /// Traffic is redirected transparently via `ss-redir`.
    Transproxy,
}

// ============================================================================
// DaemonConfig
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub mode: ServiceMode,
    pub listen_address: String,
    pub local_port: u16,
    pub transproxy_port: u16,
    pub tcp_fast_open: bool,

    /// User storage, available only once unlocked.
    pub data_dir: PathBuf,
    /// Device-level storage, always available.
    pub device_dir: PathBuf,
    /// Whether user storage starts unlocked.
    pub storage_unlocked: bool,

    /// Profile database; defaults to `<data_dir>/profiles.json`.
    pub profiles_path: Option<PathBuf>,
    /// Directory holding `ss-local`, `ss-redir` and `tun2socks`.
    pub executable_dir: PathBuf,
    pub plugin_dir: PathBuf,
    /// ACL lists; defaults to `<data_dir>/acl`.
    pub acl_dir: Option<PathBuf>,

    pub bootstrap_url: String,
    pub remote_config_url: Option<String>,
    pub acl_sync_url: Option<String>,
    /// Signed when requesting bootstrap credentials.
    pub device_identity: String,

    pub tun_device: Option<String>,
    pub tun_mtu: u16,

    /// Exit the daemon once a session stop requests full shutdown.
    pub exit_when_stopped: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("pxv"))
            .unwrap_or_else(|| PathBuf::from("/tmp/pxv"));
        let device_dir = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .map(|d| d.join("pxv").join("device"))
            .unwrap_or_else(|| PathBuf::from("/tmp/pxv/device"));

        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            mode: ServiceMode::default(),
            listen_address: "127.0.0.1".to_string(),
            local_port: 1080,
            transproxy_port: 8200,
            tcp_fast_open: false,
            data_dir,
            device_dir,
            storage_unlocked: true,
            profiles_path: None,
            executable_dir: PathBuf::from("/usr/bin"),
            plugin_dir: PathBuf::from("/usr/lib/pxv/plugins"),
            acl_dir: None,
            bootstrap_url: "https://proxy.pxv.invalid/bootstrap".to_string(),
            remote_config_url: None,
            acl_sync_url: None,
            device_identity: String::new(),
            tun_device: None,
            tun_mtu: 1500,
            exit_when_stopped: false,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from the environment-selected or default location.
    ///
    /// Applies the `PXV_SOCKET` override afterwards.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => Self::from_path(&path)?,
            _ => Self::default(),
        };

        if let Some(socket) = std::env::var_os(SOCKET_ENV) {
            config.socket_path = PathBuf::from(socket);
        }
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.profiles_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("profiles.json"))
    }

    pub fn acl_dir(&self) -> PathBuf {
        self.acl_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("acl"))
    }

    pub fn stat_path(&self) -> PathBuf {
        self.device_dir.join(STAT_SOCKET_NAME)
    }
}

/// Returns `<config_dir>/pxv/pxvd.toml` if a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pxv").join("pxvd.toml"))
}

/// Errors that can occur loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {message}")]
    ParseFile { path: PathBuf, message: String },

    #[error("Invalid config: {0}")]
    Parse(String),
}
