//! pxv Daemon - Proxy session supervisor
//!
//! This binary runs as a background daemon that owns one proxy session:
//! it launches and supervises the proxy processes for the current profile
//! and serves start/stop/reload requests and broadcasts over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! pxvd start
//!
//! # Start the daemon in the background and connect immediately
//! pxvd start -d --connect
//!
//! # Stop the daemon
//! pxvd stop
//!
//! # Check daemon status
//! pxvd status
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop the session, then exit
//! - `SIGHUP`: reload the current profile
//! - `SIGUSR1`: mark user storage as unlocked

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pxvd::acl::{AclStore, FileAclStore, PeriodicAclSyncer};
use pxvd::config::{DaemonConfig, ServiceMode, SHUTDOWN_GRACE};
use pxvd::direct_boot::DeviceStore;
use pxvd::plugin::DirectoryPluginResolver;
use pxvd::remote::{HttpBootstrapClient, HttpRemoteConfig, RemoteConfig};
use pxvd::resolve::SystemResolver;
use pxvd::server::DaemonServer;
use pxvd::session::{
    control_bus, Collaborators, ControlAction, DeliveryMode, RoutedProxyMode, SessionController,
    SessionSettings, StaticTunnelProvider, TransparentProxyMode, TunnelDeviceMode,
};
use pxvd::storage::StorageState;
use pxvd::store::JsonProfileStore;
use pxvd::supervisor::ProcessPool;

/// Default tunnel interface for the vpn mode.
const DEFAULT_TUN_DEVICE: &str = "tun0";

/// pxv daemon - proxy session supervisor
#[derive(Parser, Debug)]
#[command(name = "pxvd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Start a session for the current profile right away
        #[arg(long)]
        connect: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pxv")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("pxvd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("pxvd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let Ok(pid) = i32::try_from(pid) else {
        bail!("Invalid PID {pid}");
    };
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        connect: false,
    });

    match command {
        Command::Start { daemon, connect } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'pxvd stop' to stop it first.");
                process::exit(1);
            }

            let config = DaemonConfig::load().context("Failed to load configuration")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config, connect);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // The session is torn down before exit; allow for the
                // process grace period.
                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                let config = DaemonConfig::load().context("Failed to load configuration")?;
                if config.socket_path.exists() {
                    println!("Socket: {}", config.socket_path.display());
                }
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn delivery_mode(config: &DaemonConfig) -> Arc<dyn DeliveryMode> {
    match config.mode {
        ServiceMode::Proxy => Arc::new(RoutedProxyMode),
        ServiceMode::Vpn => {
            let device = config
                .tun_device
                .clone()
                .unwrap_or_else(|| DEFAULT_TUN_DEVICE.to_string());
            Arc::new(TunnelDeviceMode::new(Arc::new(StaticTunnelProvider::new(device))))
        }
        ServiceMode::Transproxy => Arc::new(TransparentProxyMode),
    }
}

fn collaborators(config: &DaemonConfig, cancel: &CancellationToken) -> Result<Collaborators> {
    let storage = StorageState::new(&config.data_dir, &config.device_dir, config.storage_unlocked);
    let acl_store: Arc<dyn AclStore> = Arc::new(FileAclStore::new(config.acl_dir()));
    let remote_config: Arc<dyn RemoteConfig> =
        Arc::new(HttpRemoteConfig::new(config.remote_config_url.clone()));
    let bootstrap = HttpBootstrapClient::new(
        config.bootstrap_url.clone(),
        &config.device_identity,
        Arc::clone(&remote_config),
    )
    .context("Failed to build bootstrap client")?;

    Ok(Collaborators {
        store: Arc::new(JsonProfileStore::new(config.profiles_path(), storage.clone())),
        supervisor: Arc::new(ProcessPool::new()),
        resolver: Arc::new(SystemResolver),
        plugins: Arc::new(DirectoryPluginResolver::new(&config.plugin_dir)),
        acl_syncer: Arc::new(PeriodicAclSyncer::new(
            config.acl_sync_url.clone(),
            Arc::clone(&acl_store),
            cancel.clone(),
        )),
        acl_store,
        bootstrap: Arc::new(bootstrap),
        remote_config,
        device: Arc::new(DeviceStore::new(&config.device_dir)),
        storage,
    })
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig, connect: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pxvd=info".parse()?)
                .add_directive("pxv_core=info".parse()?)
                .add_directive("pxv_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        mode = ?config.mode,
        "pxv daemon starting"
    );

    let cancel_token = CancellationToken::new();
    let collab = collaborators(&config, &cancel_token)?;
    let storage = collab.storage.clone();
    let bus = control_bus();
    let controller = SessionController::new(
        delivery_mode(&config),
        collab,
        SessionSettings::from_config(&config),
        bus.clone(),
    );

    tokio::spawn(forward_signals(
        Arc::clone(&controller),
        bus,
        storage,
        cancel_token.clone(),
    ));

    if config.exit_when_stopped {
        let session_shutdown = controller.shutdown_token();
        let server_token = cancel_token.clone();
        tokio::spawn(async move {
            session_shutdown.cancelled().await;
            info!("Session requested shutdown");
            server_token.cancel();
        });
    }

    if connect {
        controller.start().await;
    }

    let server = DaemonServer::new(&config.socket_path, Arc::clone(&controller), cancel_token);
    info!(socket = %config.socket_path.display(), "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        if !controller.stop_and_wait(true, SHUTDOWN_GRACE).await {
            warn!(state = %controller.state(), "Session did not stop before exit");
        }
        return Err(e.into());
    }

    info!("pxv daemon stopped");
    Ok(())
}

/// Maps process signals onto the session until shutdown.
async fn forward_signals(
    controller: Arc<SessionController>,
    bus: broadcast::Sender<ControlAction>,
    storage: StorageState,
    cancel: CancellationToken,
) {
    if let Err(e) = watch_signals(&controller, &bus, &storage).await {
        error!(error = %e, "Error waiting for signals");
    }
    // A stop issued while Connecting is deferred; the runtime must outlive it.
    if !controller.stop_and_wait(true, SHUTDOWN_GRACE).await {
        warn!(state = %controller.state(), "Session did not stop before exit");
    }
    cancel.cancel();
}

async fn watch_signals(
    controller: &Arc<SessionController>,
    bus: &broadcast::Sender<ControlAction>,
    storage: &StorageState,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading");
                // Without an active session nothing listens on the bus.
                if bus.send(ControlAction::Reload).is_err() {
                    controller.reload().await;
                }
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, user storage unlocked");
                storage.unlock();
            }
        }
    }
}
