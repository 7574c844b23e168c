//! Plugin executable lookup.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use pxv_core::{DomainError, PluginOptions};

/// Locates the executable for a selected plugin.
pub trait PluginResolver: Send + Sync {
    /// Returns `Ok(None)` when no plugin is selected.
    fn resolve(&self, options: &PluginOptions) -> Result<Option<PathBuf>, PluginError>;
}

/// Errors that can occur resolving a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Invalid plugin spec: {0}")]
    Spec(#[from] DomainError),

    #[error("Plugin {id} not found at {path}")]
    NotFound { id: String, path: PathBuf },

    #[error("Plugin {path} is not executable")]
    NotExecutable { path: PathBuf },

    #[error("Invalid plugin id: {0}")]
    InvalidId(String),
}

/// Finds plugins as `<dir>/<id>`.
pub struct DirectoryPluginResolver {
    dir: PathBuf,
}

impl DirectoryPluginResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PluginResolver for DirectoryPluginResolver {
    fn resolve(&self, options: &PluginOptions) -> Result<Option<PathBuf>, PluginError> {
        if options.is_empty() {
            return Ok(None);
        }
        if options.id.contains('/') || options.id == ".." {
            return Err(PluginError::InvalidId(options.id.clone()));
        }

        let path = self.dir.join(&options.id);
        let metadata = std::fs::metadata(&path).map_err(|_| PluginError::NotFound {
            id: options.id.clone(),
            path: path.clone(),
        })?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            return Err(PluginError::NotExecutable { path });
        }

        debug!(plugin = %options.id, path = %path.display(), "Resolved plugin");
        Ok(Some(path))
    }
}
