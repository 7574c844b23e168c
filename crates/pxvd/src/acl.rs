//! Access control lists for routed traffic.
//!
//! The proxy reads ACLs in the shadowsocks text format:
//!
//! ```text
//! [proxy_all]
//! [bypass_list]
//! 192.168.0.0/16
//! ^(.*\.)?example\.com$
//! #IMPORT bypass-lan
//! ```
//!
//! `#IMPORT <name>` pulls in another stored list. The proxy does not
//! understand imports, so lists are flattened before being handed to it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pxv_core::Route;

/// Name of the user-edited custom rule source.
pub const CUSTOM_RULES_USER: &str = "custom-rules-user";

/// Interval between managed list refreshes.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const IMPORT_DIRECTIVE: &str = "#IMPORT";

// ============================================================================
// Acl
// ============================================================================

/// One line of a bypass or proxy list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclEntry {
    /// A hostname regex or CIDR subnet.
    Rule(String),
    /// Another stored list to inline.
    Import(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    /// `[bypass_all]` when true, `[proxy_all]` otherwise.
    pub bypass_all: bool,
    pub bypass_list: Vec<AclEntry>,
    pub proxy_list: Vec<AclEntry>,
}

#[derive(Clone, Copy)]
enum Section {
    Bypass,
    Proxy,
}

impl Acl {
    pub fn parse(text: &str) -> Result<Self, AclError> {
        let mut acl = Self::default();
        let mut section = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            match line {
                "[bypass_all]" | "[reject_all]" => acl.bypass_all = true,
                "[proxy_all]" | "[accept_all]" => acl.bypass_all = false,
                "[bypass_list]" | "[black_list]" => section = Some(Section::Bypass),
                "[proxy_list]" | "[white_list]" => section = Some(Section::Proxy),
                _ => {
                    let entry = if let Some(name) = line.strip_prefix(IMPORT_DIRECTIVE) {
                        AclEntry::Import(name.trim().to_string())
                    } else if line.starts_with('#') {
                        continue;
                    } else {
                        AclEntry::Rule(line.to_string())
                    };
                    match section {
                        Some(Section::Bypass) => acl.bypass_list.push(entry),
                        Some(Section::Proxy) => acl.proxy_list.push(entry),
                        None => {
                            return Err(AclError::Parse {
                                line: index + 1,
                                message: format!("rule outside of a list section: {line}"),
                            })
                        }
                    }
                }
            }
        }
        Ok(acl)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.bypass_all {
            "[bypass_all]\n"
        } else {
            "[proxy_all]\n"
        });
        for (header, entries) in [
            ("[bypass_list]\n", &self.bypass_list),
            ("[proxy_list]\n", &self.proxy_list),
        ] {
            if entries.is_empty() {
                continue;
            }
            out.push_str(header);
            for entry in entries {
                match entry {
                    AclEntry::Rule(rule) => out.push_str(rule),
                    AclEntry::Import(name) => {
                        out.push_str(IMPORT_DIRECTIVE);
                        out.push(' ');
                        out.push_str(name);
                    }
                }
                out.push('\n');
            }
        }
        out
    }

    /// Inlines imports up to `depth` levels.
    ///
    /// An imported list contributes its bypass rules to the bypass list and
    /// its proxy rules to the proxy list. Imports past the depth limit, or
    /// naming lists that cannot be loaded, are dropped.
    pub fn flatten(&self, depth: usize, store: &dyn AclStore) -> Acl {
        let mut flat = Acl {
            bypass_all: self.bypass_all,
            bypass_list: Vec::new(),
            proxy_list: Vec::new(),
        };

        for (entries, section) in [
            (&self.bypass_list, Section::Bypass),
            (&self.proxy_list, Section::Proxy),
        ] {
            for entry in entries {
                match entry {
                    AclEntry::Rule(_) => match section {
                        Section::Bypass => flat.bypass_list.push(entry.clone()),
                        Section::Proxy => flat.proxy_list.push(entry.clone()),
                    },
                    AclEntry::Import(name) => {
                        if depth == 0 {
                            debug!(import = %name, "ACL import depth exhausted");
                            continue;
                        }
                        match store.load(name) {
                            Ok(Some(child)) => {
                                let child = child.flatten(depth - 1, store);
                                flat.bypass_list.extend(child.bypass_list);
                                flat.proxy_list.extend(child.proxy_list);
                            }
                            Ok(None) => debug!(import = %name, "ACL import not found"),
                            Err(e) => warn!(import = %name, error = %e, "Failed to load ACL import"),
                        }
                    }
                }
            }
        }
        flat
    }

    pub fn rule_count(&self) -> usize {
        self.bypass_list.len() + self.proxy_list.len()
    }
}

/// Errors that can occur reading, writing, or syncing ACLs.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("Invalid ACL at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("ACL I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ACL download failed: {0}")]
    Download(#[from] reqwest::Error),
}

// ============================================================================
// Storage
// ============================================================================

/// Named ACL storage.
pub trait AclStore: Send + Sync {
    /// Loads a list by name. `Ok(None)` if it does not exist.
    fn load(&self, name: &str) -> Result<Option<Acl>, AclError>;

    /// Writes the list the proxy reads for `route`, returning its path.
    fn save(&self, route: Route, acl: &Acl) -> Result<PathBuf, AclError>;

    /// Path the proxy reads for `route`.
    fn path(&self, route: Route) -> PathBuf;

    /// The user-authored custom rules, before flattening.
    fn custom_rules(&self) -> Result<Acl, AclError> {
        Ok(self.load(CUSTOM_RULES_USER)?.unwrap_or_default())
    }
}

/// Stores `<dir>/<name>.acl` files.
pub struct FileAclStore {
    dir: PathBuf,
}

impl FileAclStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.acl"))
    }
}

impl AclStore for FileAclStore {
    fn load(&self, name: &str) -> Result<Option<Acl>, AclError> {
        let path = self.file(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Acl::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AclError::Io { path, source }),
        }
    }

    fn save(&self, route: Route, acl: &Acl) -> Result<PathBuf, AclError> {
        let path = self.path(route);
        std::fs::create_dir_all(&self.dir).map_err(|source| AclError::Io {
            path: self.dir.clone(),
            source,
        })?;
        std::fs::write(&path, acl.render()).map_err(|source| AclError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn path(&self, route: Route) -> PathBuf {
        self.file(route.as_str())
    }
}

// ============================================================================
// Periodic Sync
// ============================================================================

/// Keeps managed lists fresh in the background.
pub trait AclSyncer: Send + Sync {
    /// Schedules periodic refresh of `route`. Fire-and-forget.
    fn schedule(&self, route: Route);
}

/// Downloads `<base_url>/<route>.acl` now and then every [`SYNC_INTERVAL`].
///
/// One task per route; scheduling an already scheduled route is a no-op.
pub struct PeriodicAclSyncer {
    client: reqwest::Client,
    base_url: Option<String>,
    store: Arc<dyn AclStore>,
    scheduled: Mutex<HashSet<Route>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl PeriodicAclSyncer {
    pub fn new(
        base_url: Option<String>,
        store: Arc<dyn AclStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            store,
            scheduled: Mutex::new(HashSet::new()),
            interval: SYNC_INTERVAL,
            cancel,
        }
    }

    pub fn is_scheduled(&self, route: Route) -> bool {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&route)
    }
}

impl AclSyncer for PeriodicAclSyncer {
    fn schedule(&self, route: Route) {
        let Some(base) = self.base_url.as_deref() else {
            debug!(route = %route, "No ACL sync URL configured");
            return;
        };
        if !self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(route)
        {
            return;
        }

        let url = format!("{}/{}.acl", base.trim_end_matches('/'), route.as_str());
        let client = self.client.clone();
        let store = Arc::clone(&self.store);
        let interval = self.interval;
        let cancel = self.cancel.clone();

        info!(route = %route, "Scheduled ACL sync");
        tokio::spawn(async move {
            loop {
                match download(&client, &url).await {
                    Ok(acl) => match store.save(route, &acl) {
                        Ok(path) => info!(
                            route = %route,
                            rules = acl.rule_count(),
                            path = %path.display(),
                            "ACL synced"
                        ),
                        Err(e) => warn!(route = %route, error = %e, "Failed to save synced ACL"),
                    },
                    Err(e) => warn!(route = %route, error = %e, "ACL sync failed"),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Acl, AclError> {
    let text = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Acl::parse(&text)
}
