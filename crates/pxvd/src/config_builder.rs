//! Proxy configuration artifact.
//!
//! Serializes the working profile, plus the selected plugin when there is
//! one, into the JSON file the proxy executable reads via `-c`. The file
//! holds a credential, so it lives in the no-backup directory and is
//! created with mode 0600.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use pxv_core::{PluginOptions, Profile};

use crate::config::CONFIG_FILE_NAME;
use crate::storage::StorageState;

/// Errors that can occur writing the configuration artifact.
#[derive(Debug, Error)]
pub enum ConfigBuildError {
    #[error("Failed to write proxy config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize proxy config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Plugin argument contains both quote characters: {0}")]
    Unquotable(String),
}

pub struct ConfigBuilder {
    storage: StorageState,
    tcp_fast_open: bool,
}

impl ConfigBuilder {
    pub fn new(storage: StorageState, tcp_fast_open: bool) -> Self {
        Self {
            storage,
            tcp_fast_open,
        }
    }

    /// Where the next artifact will be written, given current storage state.
    pub fn target_path(&self) -> PathBuf {
        self.storage.no_backup_dir().join(CONFIG_FILE_NAME)
    }

    /// Renders the configuration document.
    ///
    /// `extend` receives the plugin command line (`[path, "--fast-open"?]`)
    /// and may append mode-specific arguments.
    pub fn render<F>(
        &self,
        profile: &Profile,
        plugin: &PluginOptions,
        plugin_path: Option<&Path>,
        extend: F,
    ) -> Result<serde_json::Value, ConfigBuildError>
    where
        F: FnOnce(Vec<String>) -> Vec<String>,
    {
        let mut config = profile.to_config_json();
        if let Some(path) = plugin_path {
            let mut cmd = vec![path.display().to_string()];
            if self.tcp_fast_open {
                cmd.push("--fast-open".to_string());
            }
            let cmd = extend(cmd);
            config.insert("plugin".to_string(), join_command_line(&cmd)?.into());
            config.insert("plugin_opts".to_string(), plugin.to_string().into());
        }
        Ok(serde_json::Value::Object(config))
    }

    /// Renders and writes the artifact, returning its path.
    pub fn build<F>(
        &self,
        profile: &Profile,
        plugin: &PluginOptions,
        plugin_path: Option<&Path>,
        extend: F,
    ) -> Result<PathBuf, ConfigBuildError>
    where
        F: FnOnce(Vec<String>) -> Vec<String>,
    {
        let config = self.render(profile, plugin, plugin_path, extend)?;
        let json = serde_json::to_vec(&config)?;
        let path = self.target_path();
        let io_err = |source| ConfigBuildError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;

        debug!(path = %path.display(), profile_id = %profile.id, "Wrote proxy config");
        Ok(path)
    }
}

/// Joins arguments into one shell-style command line.
///
/// Arguments containing whitespace or quotes are quoted; single quotes are
/// used when the argument itself contains a double quote. An argument with
/// both kinds of quote cannot be expressed and is rejected.
pub fn join_command_line(args: &[String]) -> Result<String, ConfigBuildError> {
    let quoted = args
        .iter()
        .map(|arg| match (arg.contains('"'), arg.contains('\'')) {
            (true, true) => Err(ConfigBuildError::Unquotable(arg.clone())),
            (true, false) => Ok(format!("'{arg}'")),
            (false, single) if single || arg.is_empty() || arg.contains(char::is_whitespace) => {
                Ok(format!("\"{arg}\""))
            }
            _ => Ok(arg.clone()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join(" "))
}
