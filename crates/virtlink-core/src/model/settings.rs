//! Persisted connection records and client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mutable, user-editable part of a connection's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub autoconnect: bool,
}

/// One persisted connection. The URL is the identity and is never edited
/// through `set_settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub url: String,
    #[serde(flatten)]
    pub settings: ConnectionSettings,
}

impl ConnectionRecord {
    pub fn new(url: impl Into<String>, settings: ConnectionSettings) -> Self {
        Self {
            url: url.into(),
            settings,
        }
    }
}

/// What a Repeating Job does when a tick comes due while the previous
/// tick's work is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Dispatch another worker anyway (ticks may overlap on slow backends).
    #[default]
    Allow,
    /// Skip the tick if one is already in flight.
    Skip,
}

/// Client configuration loaded by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connections: Vec<ConnectionRecord>,
    pub poll_interval_ms: u64,
    pub overlap_policy: OverlapPolicy,
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            poll_interval_ms: 5_000,
            overlap_policy: OverlapPolicy::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let cfg = ClientConfig::from_json("{}").unwrap();
        assert!(cfg.connections.is_empty());
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.overlap_policy, OverlapPolicy::Allow);
    }

    #[test]
    fn records_flatten_settings() {
        let cfg = ClientConfig::from_json(
            r#"{
                "connections": [
                    { "url": "test://host/system", "name": "local", "autoconnect": true }
                ],
                "poll_interval_ms": 250,
                "overlap_policy": "skip"
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.connections.len(), 1);
        let rec = &cfg.connections[0];
        assert_eq!(rec.url, "test://host/system");
        assert_eq!(rec.settings.name, "local");
        assert_eq!(rec.settings.description, "");
        assert!(rec.settings.autoconnect);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.overlap_policy, OverlapPolicy::Skip);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = ClientConfig {
            poll_interval_ms: 0,
            ..ClientConfig::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1));
    }
}
