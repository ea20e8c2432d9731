use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level settings, usually loaded from a TOML file.
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub anidb: AniDbSettings,
    pub penalty: PenaltySettings,
    pub scheduler: SchedulerSettings,
    pub concurrency: ConcurrencySettings,
    pub persistence: PersistenceConfig,
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid settings")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse settings in {}", path.display()))
    }
}

/// Connection and session settings for the UDP API.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AniDbSettings {
    pub server_host: String,
    pub server_port: u16,
    /// Local UDP port. The provider expects a stable one.
    pub client_port: u16,
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub client_version: u32,
    pub protocol_version: u32,
    pub reply_timeout_secs: u64,
    /// Resends after a reply timeout before giving up.
    pub max_timeout_retries: u32,
    /// Minimum spacing between outbound commands.
    pub command_interval_ms: u64,
    pub ping_interval_secs: u64,
    /// Log out after this long without a non-ping command.
    pub logout_after_idle_secs: u64,
    /// Try the wide encoding at login before falling back to ASCII.
    pub prefer_unicode: bool,
    pub http_request_interval_ms: u64,
}

impl Default for AniDbSettings {
    fn default() -> Self {
        Self {
            server_host: "api.anidb.net".to_string(),
            server_port: 9000,
            client_port: 4556,
            username: String::new(),
            password: String::new(),
            client_name: "anisync".to_string(),
            client_version: 1,
            protocol_version: 3,
            reply_timeout_secs: 20,
            max_timeout_retries: 2,
            command_interval_ms: 2_000,
            ping_interval_secs: 90,
            logout_after_idle_secs: 300,
            prefer_unicode: true,
            http_request_interval_ms: 2_000,
        }
    }
}

/// Fallback penalty windows.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltySettings {
    pub udp_ban_window_secs: u64,
    pub http_ban_window_secs: u64,
    pub busy_backoff_secs: u64,
}

impl Default for PenaltySettings {
    fn default() -> Self {
        Self {
            udp_ban_window_secs: 30 * 60,
            http_ban_window_secs: 30 * 60,
            busy_backoff_secs: 5 * 60,
        }
    }
}

/// Worker pool, retry and housekeeping settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// How long a claim stays valid without renewal.
    pub claim_ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub housekeeper_interval_ms: u64,
    /// Resubmissions of a job that succeeded within this window are skipped.
    pub success_dedupe_window_secs: u64,
    /// Succeeded and cancelled records older than this are pruned.
    pub archive_retention_secs: u64,
    /// Eligible entries fetched per claim attempt.
    pub claim_batch: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 10 * 60 * 1_000,
            claim_ttl_secs: 60,
            poll_interval_ms: 500,
            housekeeper_interval_ms: 5_000,
            success_dedupe_window_secs: 0,
            archive_retention_secs: 7 * 24 * 60 * 60,
            claim_batch: 16,
        }
    }
}

/// Per-kind ceiling overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Job kind name to ceiling. Clamped to the kind's declared maximum.
    pub overrides: BTreeMap<String, usize>,
}

/// Which job store backs the scheduler.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

/// Configuration for job store connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,
    /// File path for sqlite, connection string for postgres.
    pub connection_string: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            connection_string: String::new(),
            max_connections: 8,
            min_connections: 1,
            acquire_timeout_seconds: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.anidb.server_port, 9000);
        assert_eq!(settings.penalty.udp_ban_window_secs, 1800);
        assert_eq!(settings.scheduler.max_attempts, 5);
        assert_eq!(settings.persistence.backend, StoreBackend::Memory);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [anidb]
            username = "user"
            command_interval_ms = 4000

            [scheduler]
            workers = 2

            [concurrency.overrides]
            "anidb.get_file" = 3

            [persistence]
            backend = "sqlite"
            connection_string = "jobs.db"
            "#,
        )
        .unwrap();

        assert_eq!(settings.anidb.username, "user");
        assert_eq!(settings.anidb.command_interval_ms, 4000);
        assert_eq!(settings.anidb.client_port, 4556);
        assert_eq!(settings.scheduler.workers, 2);
        assert_eq!(settings.scheduler.max_attempts, 5);
        assert_eq!(settings.concurrency.overrides.get("anidb.get_file"), Some(&3));
        assert_eq!(settings.persistence.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(Settings::from_toml_str("[scheduler]\nworkers = \"many\"").is_err());
    }
}
