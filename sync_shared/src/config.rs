//! Configuration system.
//!
//! Loads server configuration from JSON strings/files. Every field has a
//! default so partial files are accepted.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::snapshot::MAX_SNAPSHOT_CEILING;

/// Server version advertised to clients. A build of `-1` is an unversioned
/// development server that skips version checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub build: i32,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            build: 104,
            kind: "official".to_string(),
        }
    }
}

/// Root server configuration. Read-only to the session once hosting starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (TCP and UDP), e.g. `0.0.0.0:6567`.
    pub server_addr: String,
    /// Fixed tick rate of the session loop.
    pub tick_hz: u32,
    /// Maximum players; `0` disables the limit. Admins bypass it.
    pub player_limit: usize,
    /// Enables server-side position verification and duplicate prevention.
    pub strict: bool,
    pub enable_votekick: bool,
    pub show_connect_messages: bool,
    /// Message of the day; `off` disables it.
    pub motd: String,
    pub allow_custom_clients: bool,
    pub block_sync: bool,
    pub whitelist: bool,
    /// Optional content every client must have installed.
    pub required_content: Vec<String>,
    pub version: VersionInfo,
    /// Uncompressed byte ceiling for one snapshot buffer.
    pub max_snapshot_size: usize,
    pub entity_sync_interval_ms: u64,
    pub block_sync_interval_ms: u64,
    /// Directory holding persisted player records.
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:6567".to_string(),
            tick_hz: 60,
            player_limit: 0,
            strict: true,
            enable_votekick: true,
            show_connect_messages: true,
            motd: "off".to_string(),
            allow_custom_clients: false,
            block_sync: true,
            whitelist: false,
            required_content: Vec::new(),
            version: VersionInfo::default(),
            max_snapshot_size: 430,
            entity_sync_interval_ms: 200,
            block_sync_interval_ms: 8_000,
            data_dir: "data".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate().with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    /// Rejects values the wire format cannot carry.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.max_snapshot_size <= MAX_SNAPSHOT_CEILING,
            "max_snapshot_size {} exceeds {MAX_SNAPSHOT_CEILING}",
            self.max_snapshot_size
        );
        Ok(())
    }

    /// Whether the server runs without version enforcement.
    pub fn is_unversioned(&self) -> bool {
        self.version.build == -1
    }

    pub fn motd(&self) -> Option<&str> {
        if self.motd.eq_ignore_ascii_case("off") || self.motd.is_empty() {
            None
        } else {
            Some(&self.motd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{ "player_limit": 2, "strict": false }"#).unwrap();
        assert_eq!(cfg.player_limit, 2);
        assert!(!cfg.strict);
        assert_eq!(cfg.max_snapshot_size, 430);
        assert_eq!(cfg.version.kind, "official");
    }

    #[test]
    fn motd_off_is_disabled() {
        let mut cfg = ServerConfig::default();
        assert_eq!(cfg.motd(), None);
        cfg.motd = "welcome".into();
        assert_eq!(cfg.motd(), Some("welcome"));
    }

    #[test]
    fn snapshot_ceiling_must_fit_chunk_header() {
        let cfg = ServerConfig::from_json_str(r#"{ "max_snapshot_size": 100000 }"#).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_snapshot_size 100000"));
        assert!(ServerConfig::default().validate().is_ok());

        let path = std::env::temp_dir().join(format!("sync-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "max_snapshot_size": 100000 }"#).unwrap();
        let loaded = ServerConfig::load(&path);
        let _ = std::fs::remove_file(&path);
        assert!(loaded.is_err());
    }
}
