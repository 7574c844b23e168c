//! Plugin spec strings.
//!
//! A profile's plugin field holds one plugin per line:
//!
//! ```text
//! obfs-local;obfs=http;obfs-host=example.com;fast-open
//! v2ray-plugin;tls
//! ```
//!
//! The first token of a line is the plugin id; the rest are `key=value`
//! options or bare flags. A backslash escapes `;`, `=` and itself. The
//! first line names the selected plugin.

use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Options for a single plugin.
///
/// `Display` renders the options without the id, sorted by key, which is
/// the form the proxy passes to the plugin as `plugin_opts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginOptions {
    pub id: String,
    pub opts: BTreeMap<String, Option<String>>,
}

impl PluginOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            opts: BTreeMap::new(),
        }
    }

    /// Parses one spec line whose first token is the plugin id.
    pub fn parse_line(line: &str) -> Result<Self, DomainError> {
        let tokens = split_escaped(line.trim(), ';')?;
        let mut iter = tokens.into_iter();
        let id = iter.next().unwrap_or_default();
        let mut options = Self::new(id.trim());
        for token in iter {
            if token.is_empty() {
                continue;
            }
            options.insert_token(&token)?;
        }
        Ok(options)
    }

    /// Parses a bare option string (no id), e.g. `a=b;flag`.
    pub fn parse_opts(id: impl Into<String>, opts: &str) -> Result<Self, DomainError> {
        let mut options = Self::new(id);
        for token in split_escaped(opts, ';')? {
            if token.is_empty() {
                continue;
            }
            options.insert_token(&token)?;
        }
        Ok(options)
    }

    fn insert_token(&mut self, token: &str) -> Result<(), DomainError> {
        let mut parts = split_escaped(token, '=')?.into_iter();
        let key = parts.next().unwrap_or_default();
        let value = parts.next();
        if parts.next().is_some() {
            return Err(DomainError::ParseError {
                field: "plugin".to_string(),
                reason: format!("unescaped '=' in option {token:?}"),
            });
        }
        self.opts.insert(key, value);
        Ok(())
    }

    /// Returns true when no plugin is selected.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.opts.get(key).and_then(|v| v.as_deref())
    }
}

impl fmt::Display for PluginOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.opts {
            if !first {
                f.write_str(";")?;
            }
            first = false;
            f.write_str(&escape(key))?;
            if let Some(value) = value {
                write!(f, "={}", escape(value))?;
            }
        }
        Ok(())
    }
}

/// All plugins configured on a profile plus the selected one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfiguration {
    pub plugins: BTreeMap<String, PluginOptions>,
    pub selected: String,
}

impl PluginConfiguration {
    /// Parses a multi-line plugin spec. The first non-empty line is selected.
    pub fn parse(spec: &str) -> Result<Self, DomainError> {
        let mut config = Self::default();
        for line in spec.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let options = PluginOptions::parse_line(line)?;
            if options.is_empty() {
                continue;
            }
            if config.selected.is_empty() {
                config.selected = options.id.clone();
            }
            config.plugins.insert(options.id.clone(), options);
        }
        Ok(config)
    }

    /// Returns the options of the selected plugin, or empty options.
    pub fn selected_options(&self) -> PluginOptions {
        self.plugins
            .get(&self.selected)
            .cloned()
            .unwrap_or_default()
    }
}

fn split_escaped(input: &str, separator: char) -> Result<Vec<String>, DomainError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                // Keep escapes intact when splitting on '=' inside an already split token.
                Some(next) if separator == ';' && next != ';' => {
                    current.push('\\');
                    current.push(next);
                }
                Some(next) if separator == ';' => current.push(next),
                Some(next) => current.push(next),
                None => {
                    return Err(DomainError::ParseError {
                        field: "plugin".to_string(),
                        reason: "dangling escape".to_string(),
                    })
                }
            }
        } else if c == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    Ok(parts)
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '=' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
