//! pxv - control client for the pxv daemon
//!
//! # Usage
//!
//! ```text
//! pxv status              # Show session state
//! pxv start               # Start a session for the current profile
//! pxv stop [--shutdown]   # Stop the session (and release the daemon)
//! pxv reload              # Restart with the current profile
//! pxv watch [--bandwidth] # Follow state changes (and traffic)
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use pxv_client::{ClientConfig, ClientError, DaemonClient, SessionStatus};
use pxv_protocol::DaemonMessage;
use pxvd::config::DaemonConfig;

/// pxv - control a local proxy session
#[derive(Parser, Debug)]
#[command(name = "pxv", version, about)]
struct Args {
    /// Daemon socket (defaults to the daemon's configured path)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the session state
    Status,
    /// Start a session for the current profile
    Start,
    /// Stop the session
    Stop {
        /// Also release the daemon
        #[arg(long)]
        shutdown: bool,
    },
    /// Re-read the current profile and restart if running
    Reload,
    /// Print state changes as they happen
    Watch {
        /// Include per-second traffic updates
        #[arg(short, long)]
        bandwidth: bool,
    },
}

fn socket_path(args: &Args) -> Result<PathBuf> {
    if let Some(path) = &args.socket {
        return Ok(path.clone());
    }
    let config = DaemonConfig::load().context("Failed to load configuration")?;
    Ok(config.socket_path)
}

fn format_rate(bytes_per_sec: u64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bytes_per_sec as f64;
    let mut unit = UNITS[0];
    for &next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

fn format_status(status: &SessionStatus, now: DateTime<Utc>) -> String {
    let line = format!("{}\t{}", status.state, status.profile_name);
    let Some(since) = status.connected_since else {
        return line;
    };
    let secs = (now - since).num_seconds().max(0);
    format!(
        "{line}\tup {}h{:02}m{:02}s",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

fn print_event(msg: &DaemonMessage) {
    match msg {
        DaemonMessage::StateChanged {
            state,
            profile_name,
            message,
        } => match message {
            Some(message) => println!("{state}\t{profile_name}\t{message}"),
            None => println!("{state}\t{profile_name}"),
        },
        DaemonMessage::TrafficUpdated { profile_id, sample } => println!(
            "traffic\t{profile_id}\t↑ {}\t↓ {}\t(total {} / {} bytes)",
            format_rate(sample.tx_rate),
            format_rate(sample.rx_rate),
            sample.tx_total,
            sample.rx_total
        ),
        DaemonMessage::TrafficPersisted { profile_id } => {
            println!("traffic\t{profile_id}\tsaved");
        }
        other => debug!(?other, "Ignoring message"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = ClientConfig {
        socket_path: socket_path(&args)?,
        ..ClientConfig::default()
    };

    let mut client = match DaemonClient::connect(config).await {
        Ok(client) => client,
        Err(e) if e.is_not_running() => {
            eprintln!("{e}");
            eprintln!("Is the daemon running? Start it with 'pxvd start -d'.");
            process::exit(1);
        }
        Err(e) => return Err(e).context("Failed to connect to daemon"),
    };

    match args.command.unwrap_or(Command::Status) {
        Command::Status => {
            let status = client.get_state().await?;
            println!("{}", format_status(&status, Utc::now()));
        }
        Command::Start => client.start().await?,
        Command::Stop { shutdown } => client.stop(shutdown).await?,
        Command::Reload => client.reload().await?,
        Command::Watch { bandwidth } => {
            client.register_callback().await?;
            if bandwidth {
                client.start_bandwidth().await?;
            }
            let status = client.get_state().await?;
            println!("{}", format_status(&status, Utc::now()));
            loop {
                match client.next_event().await {
                    Ok(msg) => print_event(&msg),
                    Err(ClientError::Closed) => {
                        println!("Daemon closed the connection.");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
