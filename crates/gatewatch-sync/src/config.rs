//! # Gatewatch Configuration
//!
//! Configuration for the gateway connection, failover, caching and the
//! offline queue.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     GATEWATCH_GATEWAY_URL=https://gw.example.com                       │
//! │     GATEWATCH_GATEWAY_TOKEN=...                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/gatewatch/gatewatch.toml (Linux)                         │
//! │     ~/Library/Application Support/dev.gatewatch.gatewatch/ (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     local gateway, 30s health interval, 1s..30s backoff                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [gateway]
//! url = "https://gw.example.com"
//! token = "secret"
//!
//! [[backups]]
//! id = "staging"
//! url = "https://gw-staging.example.com"
//! priority = 50
//!
//! [health]
//! interval_secs = 30
//! max_consecutive_errors = 5
//!
//! [connection]
//! max_reconnect_attempts = 10
//!
//! [cache.ttl]
//! sessions = 30
//! search_results = 300
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use gatewatch_core::cache::ResourceClass;
use gatewatch_core::endpoint::{EndpointConfig, EndpointType};
use gatewatch_store::{CacheConfig, CacheOptions};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Gateway Settings
// =============================================================================

/// The primary gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Endpoint id of the primary gateway.
    #[serde(default = "default_gateway_id")]
    pub id: String,

    /// Display name.
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Base URL (`http://` or `https://`).
    #[serde(default = "default_gateway_url")]
    pub url: String,

    /// Bearer credential for probes, the stream and writes.
    #[serde(default)]
    pub token: Option<String>,

    /// Selection priority (higher preferred).
    #[serde(default = "default_gateway_priority")]
    pub priority: i32,

    /// Environment classification.
    #[serde(default, rename = "type")]
    pub kind: EndpointType,
}

fn default_gateway_id() -> String {
    "primary".to_string()
}

fn default_gateway_name() -> String {
    "Primary Gateway".to_string()
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:18789".to_string()
}

fn default_gateway_priority() -> i32 {
    100
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            id: default_gateway_id(),
            name: default_gateway_name(),
            url: default_gateway_url(),
            token: None,
            priority: default_gateway_priority(),
            kind: EndpointType::default(),
        }
    }
}

/// A secondary gateway used for failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupGateway {
    /// Endpoint id.
    pub id: String,

    /// Base URL.
    pub url: String,

    /// Bearer credential. Falls back to the primary gateway's token.
    #[serde(default)]
    pub token: Option<String>,

    /// Selection priority (higher preferred).
    #[serde(default = "default_backup_priority")]
    pub priority: i32,

    /// Whether the endpoint takes part in selection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment classification.
    #[serde(default, rename = "type")]
    pub kind: EndpointType,

    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_backup_priority() -> i32 {
    50
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Health Settings
// =============================================================================

/// Health probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds between health cycles.
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Probe timeout (seconds).
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Failures in a row before an endpoint is `error`.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Path appended to the gateway URL for probes.
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    10
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthSettings {
    fn default() -> Self {
        HealthSettings {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            max_consecutive_errors: default_max_consecutive_errors(),
            path: default_health_path(),
        }
    }
}

impl HealthSettings {
    /// Cycle interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Probe timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Event stream behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Path appended to the gateway URL for the stream.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Dial timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Interval between pings (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay ceiling (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Reconnect attempts before giving up. 0 retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Wait for an `auth_ok` frame before reporting connected.
    #[serde(default)]
    pub require_auth_ack: bool,

    /// How long to wait for `auth_ok` (seconds).
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,

    /// Stop reconnecting after an auth rejection.
    #[serde(default)]
    pub give_up_on_auth_rejection: bool,
}

fn default_stream_path() -> String {
    "/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_auth_timeout() -> u64 {
    10
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            stream_path: default_stream_path(),
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            require_auth_ack: false,
            auth_timeout_secs: default_auth_timeout(),
            give_up_on_auth_rejection: false,
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// TTL per resource class, in seconds. 0 means no expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlTable {
    /// Session list and session details.
    #[serde(default = "default_ttl_sessions")]
    pub sessions: u64,

    /// Agent list.
    #[serde(default = "default_ttl_agents")]
    pub agents: u64,

    /// Cron jobs.
    #[serde(default = "default_ttl_cron_jobs")]
    pub cron_jobs: u64,

    /// Search results.
    #[serde(default = "default_ttl_search_results")]
    pub search_results: u64,

    /// Gateway health.
    #[serde(default = "default_ttl_system_health")]
    pub system_health: u64,

    /// Anything else.
    #[serde(default = "default_ttl_default")]
    pub default: u64,
}

fn default_ttl_sessions() -> u64 {
    30
}

fn default_ttl_agents() -> u64 {
    60
}

fn default_ttl_cron_jobs() -> u64 {
    60
}

fn default_ttl_search_results() -> u64 {
    300
}

fn default_ttl_system_health() -> u64 {
    10
}

fn default_ttl_default() -> u64 {
    60
}

impl Default for TtlTable {
    fn default() -> Self {
        TtlTable {
            sessions: default_ttl_sessions(),
            agents: default_ttl_agents(),
            cron_jobs: default_ttl_cron_jobs(),
            search_results: default_ttl_search_results(),
            system_health: default_ttl_system_health(),
            default: default_ttl_default(),
        }
    }
}

impl TtlTable {
    /// TTL of a resource class.
    pub fn for_class(&self, class: ResourceClass) -> Duration {
        let secs = match class {
            ResourceClass::Sessions => self.sessions,
            ResourceClass::Agents => self.agents,
            ResourceClass::CronJobs => self.cron_jobs,
            ResourceClass::SearchResults => self.search_results,
            ResourceClass::SystemHealth => self.system_health,
        };
        Duration::from_secs(secs)
    }

    /// TTL for keys outside every class.
    pub fn fallback(&self) -> Duration {
        Duration::from_secs(self.default)
    }
}

/// Tiered cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Fast tier capacity.
    #[serde(default = "default_fast_capacity")]
    pub fast_capacity: usize,

    /// Slow tier capacity.
    #[serde(default = "default_slow_capacity")]
    pub slow_capacity: usize,

    /// Slow tier key prefix.
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,

    /// Seconds past expiry an entry may still be served by stale-while-revalidate.
    #[serde(default)]
    pub stale_grace_secs: u64,

    /// TTL table.
    #[serde(default)]
    pub ttl: TtlTable,
}

fn default_fast_capacity() -> usize {
    500
}

fn default_slow_capacity() -> usize {
    2000
}

fn default_cache_namespace() -> String {
    "gatewatch:cache:".to_string()
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            fast_capacity: default_fast_capacity(),
            slow_capacity: default_slow_capacity(),
            namespace: default_cache_namespace(),
            stale_grace_secs: 0,
            ttl: TtlTable::default(),
        }
    }
}

impl CacheSettings {
    /// Builds the store-level cache configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            fast_capacity: self.fast_capacity,
            slow_capacity: self.slow_capacity,
            namespace: self.namespace.clone(),
            stale_grace: Duration::from_secs(self.stale_grace_secs),
        }
    }

    /// Write options for a resource class: its TTL and its tag.
    pub fn options_for(&self, class: ResourceClass) -> CacheOptions {
        CacheOptions::new(self.ttl.for_class(class)).tags([class.tag()])
    }

    /// Write options for `key`, classified by prefix. Unclassified keys get
    /// the default TTL and no tag.
    pub fn options_for_key(&self, key: &str) -> CacheOptions {
        match ResourceClass::for_key(key) {
            Some(class) => self.options_for(class),
            None => CacheOptions::new(self.ttl.fallback()),
        }
    }
}

// =============================================================================
// Queue, Storage and Status Settings
// =============================================================================

/// Offline write queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Prefix of the persisted queue key (`<namespace>sync-queue`).
    #[serde(default = "default_queue_namespace")]
    pub namespace: String,

    /// Seconds between drain retries while online.
    #[serde(default = "default_queue_retry")]
    pub retry_interval_secs: u64,

    /// Timeout of one replayed write (seconds).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

fn default_queue_namespace() -> String {
    "gatewatch:".to_string()
}

fn default_queue_retry() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    15
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            namespace: default_queue_namespace(),
            retry_interval_secs: default_queue_retry(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

/// Where the slow tier and queue live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Keep everything in memory (nothing survives a restart).
    #[serde(default)]
    pub in_memory: bool,
}

/// Status HTTP server of the monitor binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSettings {
    /// Serve `/health` and `/status`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address.
    #[serde(default = "default_status_bind")]
    pub bind_addr: String,

    /// Port.
    #[serde(default = "default_status_port")]
    pub port: u16,
}

fn default_status_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8790
}

impl Default for StatusSettings {
    fn default() -> Self {
        StatusSettings {
            enabled: true,
            bind_addr: default_status_bind(),
            port: default_status_port(),
        }
    }
}

impl StatusSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Gatewatch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewatchConfig {
    /// Primary gateway.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Failover gateways.
    #[serde(default)]
    pub backups: Vec<BackupGateway>,

    /// Health probing.
    #[serde(default)]
    pub health: HealthSettings,

    /// Event stream.
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Tiered cache.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Offline write queue.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Persistent storage.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Status server.
    #[serde(default)]
    pub status: StatusSettings,
}

impl GatewatchConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (gatewatch.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let mut ids = HashSet::new();
        for endpoint in self.endpoints() {
            endpoint.validate()?;
            if !ids.insert(endpoint.id.clone()) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate gateway id '{}'",
                    endpoint.id
                )));
            }
        }

        if self.health.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "health.interval_secs must be greater than 0".into(),
            ));
        }
        if self.health.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "health.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.health.max_consecutive_errors == 0 {
            return Err(SyncError::InvalidConfig(
                "health.max_consecutive_errors must be greater than 0".into(),
            ));
        }

        let conn = &self.connection;
        if conn.heartbeat_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connection.heartbeat_interval_secs must be greater than 0".into(),
            ));
        }
        if conn.initial_backoff_ms == 0
            || conn.initial_backoff_ms > conn.max_backoff_secs.saturating_mul(1000)
        {
            return Err(SyncError::InvalidConfig(
                "connection backoff must satisfy 0 < initial_backoff_ms <= max_backoff_secs * 1000"
                    .into(),
            ));
        }

        if self.cache.fast_capacity == 0 || self.cache.slow_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "cache capacities must be greater than 0".into(),
            ));
        }

        if self.queue.retry_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "queue.retry_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup` (environment variable name → value).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("GATEWATCH_GATEWAY_URL") {
            debug!(url = %url, "Overriding gateway URL from environment");
            self.gateway.url = url;
        }

        if let Some(token) = lookup("GATEWATCH_GATEWAY_TOKEN") {
            self.gateway.token = Some(token).filter(|t| !t.is_empty());
        }

        if let Some(list) = lookup("GATEWATCH_BACKUP_GATEWAYS") {
            self.backups = parse_backup_list(&list);
            debug!(count = self.backups.len(), "Overriding backup gateways from environment");
        }

        if let Some(secs) = lookup("GATEWATCH_HEALTH_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.health.interval_secs = s,
                Err(_) => warn!(value = %secs, "Invalid GATEWATCH_HEALTH_INTERVAL_SECS"),
            }
        }

        if let Some(attempts) = lookup("GATEWATCH_MAX_RECONNECT_ATTEMPTS") {
            match attempts.parse::<u32>() {
                Ok(a) => self.connection.max_reconnect_attempts = a,
                Err(_) => warn!(value = %attempts, "Invalid GATEWATCH_MAX_RECONNECT_ATTEMPTS"),
            }
        }

        if let Some(path) = lookup("GATEWATCH_STORAGE_PATH") {
            if path == ":memory:" {
                self.storage.in_memory = true;
            } else {
                self.storage.path = Some(PathBuf::from(path));
            }
        }

        if let Some(port) = lookup("GATEWATCH_STATUS_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.status.port = p,
                Err(_) => warn!(value = %port, "Invalid GATEWATCH_STATUS_PORT"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("gatewatch.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Every configured gateway as an endpoint config, primary first.
    pub fn endpoints(&self) -> Vec<EndpointConfig> {
        let gw = &self.gateway;
        let mut primary = EndpointConfig::new(&gw.id, &gw.url)
            .with_name(&gw.name)
            .with_priority(gw.priority)
            .with_kind(gw.kind);
        if let Some(token) = &gw.token {
            primary = primary.with_credential(token);
        }

        let mut endpoints = vec![primary];
        for backup in &self.backups {
            let mut endpoint = EndpointConfig::new(&backup.id, &backup.url)
                .with_priority(backup.priority)
                .with_kind(backup.kind)
                .with_tags(backup.tags.iter().cloned());
            if let Some(token) = backup.token.as_ref().or(gw.token.as_ref()) {
                endpoint = endpoint.with_credential(token);
            }
            if !backup.enabled {
                endpoint = endpoint.disabled();
            }
            endpoints.push(endpoint);
        }
        endpoints
    }

    /// SQLite path: the configured one or `gatewatch.db` in the data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage
            .path
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("gatewatch.db")))
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "gatewatch", "gatewatch")
}

/// Parses `id=url,url,...`. Bare URLs get `backup-<n>` ids (1-based).
fn parse_backup_list(list: &str) -> Vec<BackupGateway> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .enumerate()
        .map(|(index, item)| {
            let (id, url) = match item.split_once('=') {
                Some((id, url)) if !id.contains("://") => (id.trim().to_string(), url.trim()),
                _ => (format!("backup-{}", index + 1), item),
            };
            BackupGateway {
                id,
                url: url.to_string(),
                token: None,
                priority: default_backup_priority(),
                enabled: true,
                kind: EndpointType::default(),
                tags: Vec::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = GatewatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.health.max_consecutive_errors, 5);
        assert_eq!(config.connection.heartbeat_interval_secs, 30);
        assert_eq!(config.connection.initial_backoff_ms, 1000);
        assert_eq!(config.connection.max_backoff_secs, 30);
        assert!(!config.connection.give_up_on_auth_rejection);
        assert_eq!(config.endpoints().len(), 1);
    }

    #[test]
    fn test_ttl_table() {
        let ttl = TtlTable::default();
        assert_eq!(ttl.for_class(ResourceClass::Sessions), Duration::from_secs(30));
        assert_eq!(ttl.for_class(ResourceClass::SearchResults), Duration::from_secs(300));
        assert_eq!(ttl.fallback(), Duration::from_secs(60));
    }

    #[test]
    fn test_cache_options_follow_ttl_table() {
        let mut settings = CacheSettings::default();
        settings.ttl.agents = 5;

        let options = settings.options_for(ResourceClass::Agents);
        assert_eq!(options.ttl, Duration::from_secs(5));
        assert!(options.tags.contains("agents"));

        let options = settings.options_for_key("cron:jobs");
        assert_eq!(options.ttl, Duration::from_secs(60));
        assert!(options.tags.contains("cron"));

        let options = settings.options_for_key("models");
        assert_eq!(options.ttl, Duration::from_secs(60));
        assert!(options.tags.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GATEWATCH_GATEWAY_URL", "https://gw.example.com"),
            ("GATEWATCH_GATEWAY_TOKEN", "s3cret"),
            (
                "GATEWATCH_BACKUP_GATEWAYS",
                "staging=https://staging.example.com, http://10.0.0.2:18789",
            ),
            ("GATEWATCH_HEALTH_INTERVAL_SECS", "15"),
            ("GATEWATCH_MAX_RECONNECT_ATTEMPTS", "not-a-number"),
            ("GATEWATCH_STATUS_PORT", "9000"),
        ]);

        let mut config = GatewatchConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.gateway.url, "https://gw.example.com");
        assert_eq!(config.health.interval_secs, 15);
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.status.port, 9000);

        let ids: Vec<&str> = config.backups.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["staging", "backup-2"]);
        assert_eq!(config.backups[1].url, "http://10.0.0.2:18789");

        // Backups inherit the primary token.
        let endpoints = config.endpoints();
        assert_eq!(endpoints[2].credential.as_deref(), Some("s3cret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = GatewatchConfig::default();
        config.gateway.url = "ws://wrong-scheme".to_string();
        assert!(config.validate().unwrap_err().is_config_error());

        let mut config = GatewatchConfig::default();
        config.backups = parse_backup_list("primary=http://other");
        assert!(config.validate().is_err());

        let mut config = GatewatchConfig::default();
        config.connection.initial_backoff_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = GatewatchConfig::default();
        config.health.max_consecutive_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatewatch.toml");

        let mut config = GatewatchConfig::default();
        config.backups = parse_backup_list("dr=https://dr.example.com");
        config.cache.ttl.sessions = 5;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[gateway]"));
        assert!(contents.contains("[[backups]]"));

        let loaded: GatewatchConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.backups[0].id, "dr");
        assert_eq!(loaded.cache.ttl.sessions, 5);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: GatewatchConfig = toml::from_str(
            r#"
            [gateway]
            url = "https://gw.example.com"

            [cache.ttl]
            agents = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.id, "primary");
        assert_eq!(config.cache.ttl.agents, 120);
        assert_eq!(config.cache.ttl.sessions, 30);
        assert_eq!(config.connection.max_reconnect_attempts, 10);
    }
}
