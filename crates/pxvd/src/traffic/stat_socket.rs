//! Stat socket fed by the proxy process.
//!
//! The proxy connects periodically and writes 16-byte records: lifetime
//! tx then rx bytes, each a little-endian `u64`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TrafficMonitor;

/// Size of one `(tx_total, rx_total)` record.
pub const STAT_RECORD_LEN: usize = 16;

/// Binds the stat socket and feeds records into `monitor` until cancelled.
///
/// A stale socket file at `path` is replaced. The file is removed on
/// cancellation.
pub fn spawn_stat_listener(
    path: &Path,
    monitor: Arc<TrafficMonitor>,
    cancel: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    let path = path.to_path_buf();
    debug!(socket = %path.display(), "Stat socket listening");

    Ok(tokio::spawn(run(listener, path, monitor, cancel)))
}

async fn run(
    listener: UnixListener,
    path: PathBuf,
    monitor: Arc<TrafficMonitor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = listener.accept() => match result {
                Ok((stream, _addr)) => {
                    let monitor = Arc::clone(&monitor);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            result = read_records(stream, &monitor) => {
                                if let Err(e) = result {
                                    debug!(error = %e, "Stat connection closed with error");
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept stat connection"),
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&path) {
        debug!(socket = %path.display(), error = %e, "Failed to remove stat socket");
    }
    info!("Stat socket stopped");
}

async fn read_records(mut stream: UnixStream, monitor: &TrafficMonitor) -> io::Result<()> {
    let mut buf = [0u8; STAT_RECORD_LEN];
    loop {
        match stream.read_exact(&mut buf).await {
            Ok(_) => {
                let (tx, rx) = decode_record(&buf);
                monitor.update(tx, rx);
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn decode_record(buf: &[u8; STAT_RECORD_LEN]) -> (u64, u64) {
    let (tx, rx) = buf.split_at(8);
    let tx = <[u8; 8]>::try_from(tx).unwrap_or_default();
    let rx = <[u8; 8]>::try_from(rx).unwrap_or_default();
    (u64::from_le_bytes(tx), u64::from_le_bytes(rx))
}
