//! Bounded hostname resolution.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Resolves a hostname to addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Errors that can occur resolving a hostname.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Resolving {host} timed out after {}s", timeout.as_secs())]
    Timeout { host: String, timeout: Duration },

    #[error("Failed to resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} resolved to no addresses")]
    Empty { host: String },

    #[error("Resolver task for {host} failed")]
    Aborted { host: String },
}

/// Uses the system resolver through tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Resolves `host` on its own task, giving up after `timeout`.
///
/// The resolver task is aborted on timeout; a hung resolver never blocks
/// the caller past the deadline. An empty result is an error.
pub async fn resolve_host(
    resolver: Arc<dyn HostResolver>,
    host: &str,
    timeout: Duration,
) -> Result<IpAddr, ResolveError> {
    let owned = host.to_string();
    let mut task = tokio::spawn(async move { resolver.resolve(&owned).await });

    let result = match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined.map_err(|_| ResolveError::Aborted {
            host: host.to_string(),
        })?,
        Err(_) => {
            task.abort();
            warn!(host = %host, timeout_secs = timeout.as_secs(), "DNS resolution timed out");
            return Err(ResolveError::Timeout {
                host: host.to_string(),
                timeout,
            });
        }
    };

    let address = result?
        .into_iter()
        .next()
        .ok_or_else(|| ResolveError::Empty {
            host: host.to_string(),
        })?;
    debug!(host = %host, address = %address, "Resolved host");
    Ok(address)
}
