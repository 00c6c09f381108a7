//! Configuration resolution for Anchor.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/anchor/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`ANCHOR_*`)
//!
//! CLI flags are applied on top by the binary.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder substituted with the lower-cased region in endpoint templates.
pub const REGION_PLACEHOLDER: &str = "{region}";

/// Complete Anchor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// HTTP listener and storage location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            database_path: None,
        }
    }
}

/// Upstream provider endpoints and fetch policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CloudConfig {
    /// Current-generation compute API base, with `{region}` placeholder.
    pub compute_url: String,
    /// Legacy-generation compute API base.
    pub legacy_compute_url: String,
    /// Block-storage API base, with `{region}` placeholder.
    pub block_storage_url: String,
    /// Identity API base used for token validation.
    pub identity_url: String,
    /// Page size requested from the paginated server listing.
    pub page_limit: u32,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Attempts per page for retryable failures (at least 1).
    pub max_attempts: u32,
    /// Upper bound on a whole snapshot build.
    pub build_deadline_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            compute_url: "https://{region}.servers.api.rackspacecloud.com/v2".to_string(),
            legacy_compute_url: "https://servers.api.rackspacecloud.com/v1.0".to_string(),
            block_storage_url: "https://{region}.blockstorage.api.rackspacecloud.com/v1"
                .to_string(),
            identity_url: "https://identity.api.rackspacecloud.com/v2.0".to_string(),
            page_limit: 100,
            request_timeout_secs: 30,
            max_attempts: 2,
            build_deadline_secs: 600,
        }
    }
}

impl CloudConfig {
    /// Point every endpoint at one base URL. Used by tests against a local mock.
    pub fn with_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            compute_url: format!("{base}/{REGION_PLACEHOLDER}/v2"),
            legacy_compute_url: format!("{base}/v1.0"),
            block_storage_url: format!("{base}/{REGION_PLACEHOLDER}/volume/v1"),
            identity_url: format!("{base}/identity/v2.0"),
            ..Self::default()
        }
    }
}

/// Snapshot cache lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60, // 1 day
        }
    }
}

/// Background job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobsConfig {
    pub max_concurrency: usize,
    /// How long finished job results stay pollable.
    pub result_ttl_secs: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            result_ttl_secs: 3600,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit path must exist; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit {
        config = merge_config(config, load_config_file(path)?);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Default location of the cache database.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("anchor.db"))
}

fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("anchor"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay sections replace base sections; an unset database path keeps the base one.
fn merge_config(base: Config, overlay: Config) -> Config {
    let database_path = overlay.server.database_path.or(base.server.database_path);
    Config {
        server: ServerConfig {
            database_path,
            ..overlay.server
        },
        ..overlay
    }
}

/// Apply `ANCHOR_*` overrides. Unparseable numeric values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = var("ANCHOR_LISTEN_ADDR").and_then(|v| v.parse().ok()) {
        config.server.listen_addr = addr;
    }
    if let Some(path) = var("ANCHOR_DATABASE_PATH") {
        config.server.database_path = Some(PathBuf::from(path));
    }
    if let Some(url) = var("ANCHOR_COMPUTE_URL") {
        config.cloud.compute_url = url;
    }
    if let Some(url) = var("ANCHOR_LEGACY_COMPUTE_URL") {
        config.cloud.legacy_compute_url = url;
    }
    if let Some(url) = var("ANCHOR_BLOCK_STORAGE_URL") {
        config.cloud.block_storage_url = url;
    }
    if let Some(url) = var("ANCHOR_IDENTITY_URL") {
        config.cloud.identity_url = url;
    }
    if let Some(n) = var("ANCHOR_PAGE_LIMIT").and_then(|v| v.parse().ok()) {
        config.cloud.page_limit = n;
    }
    if let Some(n) = var("ANCHOR_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.cloud.request_timeout_secs = n;
    }
    if let Some(n) = var("ANCHOR_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.cache.ttl_secs = n;
    }
    if let Some(n) = var("ANCHOR_MAX_JOBS").and_then(|v| v.parse().ok()) {
        config.jobs.max_concurrency = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_cache_ttl_is_one_day() {
        assert_eq!(Config::default().cache.ttl_secs, 86_400);
    }

    #[test]
    fn default_page_limit_is_100() {
        assert_eq!(Config::default().cloud.page_limit, 100);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"cloud": {"page_limit": 25}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.cloud.page_limit, 25);
        assert_eq!(config.cloud.max_attempts, 2);
        assert_eq!(config.jobs, JobsConfig::default());
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = load_config_file(Path::new("/nonexistent/anchor.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn merge_keeps_base_database_path() {
        let mut base = Config::default();
        base.server.database_path = Some(PathBuf::from("/var/lib/anchor.db"));
        let mut overlay = Config::default();
        overlay.cache.ttl_secs = 60;

        let merged = merge_config(base, overlay);
        assert_eq!(merged.cache.ttl_secs, 60);
        assert_eq!(
            merged.server.database_path,
            Some(PathBuf::from("/var/lib/anchor.db"))
        );
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("ANCHOR_PAGE_LIMIT", "50"),
            ("ANCHOR_MAX_JOBS", "not-a-number"),
            ("ANCHOR_COMPUTE_URL", "http://localhost:9000/{region}"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.cloud.page_limit, 50);
        assert_eq!(config.jobs.max_concurrency, 4);
        assert_eq!(config.cloud.compute_url, "http://localhost:9000/{region}");
    }

    #[test]
    fn base_url_helper_keeps_region_placeholder() {
        let cloud = CloudConfig::with_base_url("http://127.0.0.1:1234/");
        assert_eq!(cloud.compute_url, "http://127.0.0.1:1234/{region}/v2");
        assert_eq!(cloud.identity_url, "http://127.0.0.1:1234/identity/v2.0");
    }
}
