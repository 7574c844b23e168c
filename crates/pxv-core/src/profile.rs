//! Connection profiles and routing selectors.

use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identifier of a persisted connection profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(i64);

impl ProfileId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ProfileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Route Selector
// ============================================================================

/// Which traffic the proxy carries, expressed as an ACL list name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Route {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "bypass-lan")]
    BypassLan,
    #[serde(rename = "bypass-china")]
    BypassChina,
    #[serde(rename = "bypass-lan-china")]
    BypassLanChina,
    #[serde(rename = "gfwlist")]
    GfwList,
    #[serde(rename = "china-list")]
    ChinaList,
    #[serde(rename = "custom-rules")]
    CustomRules,
}

impl Route {
    /// Every route, in display order.
    pub const ALL_ROUTES: [Route; 7] = [
        Route::All,
        Route::BypassLan,
        Route::BypassChina,
        Route::BypassLanChina,
        Route::GfwList,
        Route::ChinaList,
        Route::CustomRules,
    ];

    /// Returns the ACL list name, also used as the on-disk file stem.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::BypassLan => "bypass-lan",
            Self::BypassChina => "bypass-china",
            Self::BypassLanChina => "bypass-lan-china",
            Self::GfwList => "gfwlist",
            Self::ChinaList => "china-list",
            Self::CustomRules => "custom-rules",
        }
    }

    /// Returns true for lists maintained remotely and synced periodically.
    pub fn is_managed(self) -> bool {
        !matches!(self, Self::All | Self::CustomRules)
    }

    /// Returns true when the proxy needs an ACL file.
    pub fn needs_acl(self) -> bool {
        self != Self::All
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL_ROUTES
            .iter()
            .copied()
            .find(|route| route.as_str() == s)
            .ok_or_else(|| DomainError::invalid("route", s, "a known ACL list name"))
    }
}

// ============================================================================
// Profile
// ============================================================================

/// A stored proxy connection profile.
///
/// The profile store owns the canonical copy. The session controller keeps a
/// working copy for one attempt, which may diverge (bootstrap replacement,
/// resolved host) and must never be written back wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub host: String,

    pub remote_port: u16,

    pub password: String,

    pub method: String,

    /// Plugin spec string, see [`crate::PluginConfiguration`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    #[serde(default)]
    pub route: Route,

    #[serde(default)]
    pub udpdns: bool,

    /// Cumulative bytes sent.
    #[serde(default)]
    pub tx: u64,

    /// Cumulative bytes received.
    #[serde(default)]
    pub rx: u64,
}

impl Profile {
    /// Creates a profile with default route and zeroed counters.
    pub fn new(
        id: ProfileId,
        host: impl Into<String>,
        remote_port: u16,
        password: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: None,
            host: host.into(),
            remote_port,
            password: password.into(),
            method: method.into(),
            plugin: None,
            route: Route::All,
            udpdns: false,
            tx: 0,
            rx: 0,
        }
    }

    /// Returns the display name: the explicit name if set, else `host:port`.
    ///
    /// IPv6 literals are bracketed.
    pub fn formatted_name(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.formatted_address(),
        }
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn formatted_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.remote_port)
        } else {
            format!("{}:{}", self.host, self.remote_port)
        }
    }

    /// Returns true when host and credential are both present.
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && !self.password.is_empty()
    }

    /// Returns true when the host is an IP literal and needs no resolution.
    pub fn has_numeric_host(&self) -> bool {
        is_numeric_address(&self.host)
    }

    /// Serializes the fields the proxy executable reads from its config file.
    pub fn to_config_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("server".to_string(), self.host.clone().into());
        map.insert("server_port".to_string(), self.remote_port.into());
        map.insert("password".to_string(), self.password.clone().into());
        map.insert("method".to_string(), self.method.clone().into());
        map
    }

    /// Adds traffic to the cumulative counters, saturating at `u64::MAX`.
    pub fn add_traffic(&mut self, tx: u64, rx: u64) {
        self.tx = self.tx.saturating_add(tx);
        self.rx = self.rx.saturating_add(rx);
    }
}

/// Returns true if `host` is a literal IPv4 or IPv6 address.
pub fn is_numeric_address(host: &str) -> bool {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    !trimmed.is_empty() && trimmed.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Profile {
        Profile::new(ProfileId::new(1), "1.2.3.4", 8388, "p", "aes-256-gcm")
    }

    #[test]
    fn test_formatted_name_prefers_explicit_name() {
        let mut profile = sample();
        profile.name = Some("Tokyo".to_string());
        assert_eq!(profile.formatted_name(), "Tokyo");
    }

    #[test]
    fn test_formatted_name_falls_back_to_address() {
        let mut profile = sample();
        assert_eq!(profile.formatted_name(), "1.2.3.4:8388");

        profile.name = Some(String::new());
        assert_eq!(profile.formatted_name(), "1.2.3.4:8388");

        profile.host = "2001:db8::1".to_string();
        assert_eq!(profile.formatted_name(), "[2001:db8::1]:8388");
    }

    #[test]
    fn test_is_complete() {
        let mut profile = sample();
        assert!(profile.is_complete());

        profile.password.clear();
        assert!(!profile.is_complete());

        let mut profile = sample();
        profile.host = "  ".to_string();
        assert!(!profile.is_complete());
    }

    #[test]
    fn test_config_json_has_exactly_four_fields() {
        let json = sample().to_config_json();
        assert_eq!(json.len(), 4);
        assert_eq!(json.get("server"), Some(&serde_json::json!("1.2.3.4")));
        assert_eq!(json.get("server_port"), Some(&serde_json::json!(8388)));
        assert_eq!(json.get("password"), Some(&serde_json::json!("p")));
        assert_eq!(json.get("method"), Some(&serde_json::json!("aes-256-gcm")));
    }

    #[test]
    fn test_numeric_address() {
        assert!(is_numeric_address("1.2.3.4"));
        assert!(is_numeric_address("::1"));
        assert!(is_numeric_address("[2001:db8::1]"));
        assert!(!is_numeric_address("example.com"));
        assert!(!is_numeric_address(""));
        assert!(!is_numeric_address("1.2.3"));
    }

    #[test]
    fn test_route_names_roundtrip() {
        for route in Route::ALL_ROUTES {
            assert_eq!(route.as_str().parse::<Route>(), Ok(route));
            let json = serde_json::to_string(&route).unwrap();
            assert_eq!(json, format!("\"{}\"", route.as_str()));
        }
        assert!("nope".parse::<Route>().is_err());
    }

    #[test]
    fn test_route_classification() {
        assert!(!Route::All.is_managed());
        assert!(!Route::CustomRules.is_managed());
        assert!(Route::GfwList.is_managed());
        assert!(!Route::All.needs_acl());
        assert!(Route::CustomRules.needs_acl());
    }

    #[test]
    fn test_add_traffic_saturates() {
        let mut profile = sample();
        profile.tx = u64::MAX - 1;
        profile.add_traffic(10, 5);
        assert_eq!(profile.tx, u64::MAX);
        assert_eq!(profile.rx, 5);
    }

    #[test]
    fn test_profile_deserialize_defaults() {
        let json = r#"{"id":7,"host":"h","remote_port":1,"password":"x","method":"m"}"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.id, ProfileId::new(7));
        assert_eq!(profile.route, Route::All);
        assert_eq!(profile.tx, 0);
        assert!(profile.plugin.is_none());
    }
}
