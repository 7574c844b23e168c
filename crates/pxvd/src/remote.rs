//! Remote bootstrap credentials and remote configuration.
//!
//! A profile whose host is the bootstrap sentinel carries no usable
//! credentials; before connecting, the daemon exchanges a signed device
//! identity for a list of candidate servers and picks one at random.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use pxv_core::Profile;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote config key overriding the bootstrap endpoint.
pub const PROXY_URL_KEY: &str = "proxy_url";

// ============================================================================
// Bootstrap
// ============================================================================

/// One `host:port:password:method` entry from the bootstrap response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCandidate {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub method: String,
}

impl ServerCandidate {
    /// Replaces the connection fields of `profile` with this candidate.
    pub fn apply_to(&self, profile: &mut Profile) {
        profile.host = self.host.clone();
        profile.remote_port = self.port;
        profile.password = self.password.clone();
        profile.method = self.method.clone();
    }
}

/// Errors that can occur during the bootstrap exchange.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Bootstrap request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Bootstrap response contained no usable server")]
    NoCandidates,
}

/// Obtains replacement server credentials for the sentinel host.
#[async_trait]
pub trait BootstrapClient: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<ServerCandidate>, BootstrapError>;
}

/// Parses a `|`-separated candidate list, skipping malformed entries.
pub fn parse_candidates(body: &str) -> Vec<ServerCandidate> {
    body.split('|')
        .filter_map(|entry| {
            let mut fields = entry.split(':').map(str::trim);
            let host = fields.next()?;
            let port = fields.next()?.parse().ok()?;
            let password = fields.next()?;
            let method = fields.next()?;
            if host.is_empty() || password.is_empty() || method.is_empty() || fields.next().is_some()
            {
                debug!(entry = %entry.trim(), "Skipping malformed bootstrap candidate");
                return None;
            }
            Some(ServerCandidate {
                host: host.to_string(),
                port,
                password: password.to_string(),
                method: method.to_string(),
            })
        })
        .collect()
}

/// Picks one candidate uniformly at random.
pub fn choose_candidate(candidates: &[ServerCandidate]) -> Result<ServerCandidate, BootstrapError> {
    candidates
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or(BootstrapError::NoCandidates)
}

/// Base64 of the SHA-256 digest of the device identity.
pub fn device_signature(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    general_purpose::STANDARD.encode(digest)
}

/// Posts the device signature as form field `sig` and parses the reply.
pub struct HttpBootstrapClient {
    client: reqwest::Client,
    default_url: String,
    signature: String,
    remote: Arc<dyn RemoteConfig>,
}

impl HttpBootstrapClient {
    pub fn new(
        default_url: impl Into<String>,
        device_identity: &str,
        remote: Arc<dyn RemoteConfig>,
    ) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            default_url: default_url.into(),
            signature: device_signature(device_identity),
            remote,
        })
    }

    fn endpoint(&self) -> String {
        self.remote
            .proxy_url()
            .unwrap_or_else(|| self.default_url.clone())
    }
}

#[async_trait]
impl BootstrapClient for HttpBootstrapClient {
    async fn fetch_candidates(&self) -> Result<Vec<ServerCandidate>, BootstrapError> {
        let url = self.endpoint();
        debug!(url = %url, "Requesting bootstrap servers");
        let body = self
            .client
            .post(&url)
            .form(&[("sig", self.signature.as_str())])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let candidates = parse_candidates(&body);
        info!(count = candidates.len(), "Received bootstrap servers");
        Ok(candidates)
    }
}

// ============================================================================
// Remote Config
// ============================================================================

/// Best-effort remotely managed settings.
pub trait RemoteConfig: Send + Sync {
    /// Starts a background refresh. Never blocks, never fails.
    fn fetch(&self);

    /// Bootstrap endpoint override, if the remote document provides one.
    fn proxy_url(&self) -> Option<String>;
}

/// Caches a JSON document fetched from `url`.
pub struct HttpRemoteConfig {
    client: reqwest::Client,
    url: Option<String>,
    cache: Arc<RwLock<serde_json::Map<String, serde_json::Value>>>,
    in_flight: Arc<AtomicBool>,
}

impl HttpRemoteConfig {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            cache: Arc::new(RwLock::new(serde_json::Map::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Replaces the cached document.
    pub fn set_document(&self, document: serde_json::Map<String, serde_json::Value>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = document;
    }
}

impl RemoteConfig for HttpRemoteConfig {
    fn fetch(&self) {
        let Some(url) = self.url.clone() else {
            return;
        };
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }

        let client = self.client.clone();
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let result: Result<serde_json::Map<String, serde_json::Value>, reqwest::Error> = async {
                client
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<serde_json::Map<String, serde_json::Value>>()
                    .await
            }
            .await;
            match result {
                Ok(document) => {
                    debug!(keys = document.len(), "Remote config refreshed");
                    *cache.write().unwrap_or_else(PoisonError::into_inner) = document;
                }
                Err(e) => warn!(url = %url, error = %e, "Remote config fetch failed"),
            }
            in_flight.store(false, Ordering::Release);
        });
    }

    fn proxy_url(&self) -> Option<String> {
        self.get(PROXY_URL_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
    }
}
