//! Configuration management for the storage connector
//!
//! Settings are loaded from a TOML file, then overridden from `CMIS_*`
//! environment variables, then validated. Durations are written as strings
//! such as `"30s"`, `"500ms"` or `"2m"`.

use crate::core::error::{Error, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "cmis-store.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Document store connection settings
    pub store: StoreConfig,

    /// Client pool settings
    pub pool: PoolConfig,

    /// Endpoint resolution settings
    pub endpoint: EndpointConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// What to do when a delete carries a revision that is no longer current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleRevisionPolicy {
    /// Re-read the current revision once and delete with it (at-least-once delete)
    #[default]
    RefreshOnce,
    /// Pass the caller's revision through and surface any conflict
    Strict,
}

/// Document store connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Statically configured base URL
    pub url: String,

    /// Explicit override that wins over every other source
    pub url_override: Option<String>,

    /// Maximum idle connections kept per host
    pub max_connections: usize,

    /// TCP connect timeout
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub connection_timeout: Duration,

    /// Longest wait for the next bytes of a response; not a total deadline
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub socket_timeout: Duration,

    /// Send HTTP Basic credentials
    pub auth_enabled: bool,

    /// Basic auth user
    pub username: Option<String>,

    /// Basic auth password
    pub password: Option<String>,

    /// Documents per bulk request
    pub bulk_chunk_size: usize,

    /// Delete-time handling of stale revisions
    pub stale_revision_policy: StaleRevisionPolicy,
}

/// Client pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Logical repositories served by this process
    pub repositories: Vec<String>,

    /// Suffix naming each repository's archive database; empty disables archives
    pub archive_suffix: String,

    /// Database holding repository-wide configuration documents
    pub config_database: String,

    /// Connection attempts before initialization is declared failed
    pub init_max_attempts: u32,

    /// Fixed delay between connection attempts
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub init_retry_delay: Duration,
}

/// Endpoint resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Rewrite loopback hosts when running inside a container
    pub detect_container: bool,

    /// Service-discovery name used for the rewrite
    pub container_host: String,

    /// Environment variable carrying a document store URL
    pub url_env_var: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5984".to_string(),
            url_override: None,
            max_connections: 40,
            connection_timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(60),
            auth_enabled: false,
            username: None,
            password: None,
            bulk_chunk_size: 1000,
            stale_revision_policy: StaleRevisionPolicy::RefreshOnce,
        }
    }
}

// Hand-written so the password never reaches a log line
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("url_override", &self.url_override)
            .field("max_connections", &self.max_connections)
            .field("connection_timeout", &self.connection_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("auth_enabled", &self.auth_enabled)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("bulk_chunk_size", &self.bulk_chunk_size)
            .field("stale_revision_policy", &self.stale_revision_policy)
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            repositories: vec!["bedroom".to_string()],
            archive_suffix: "_closet".to_string(),
            config_database: "nemaki_conf".to_string(),
            init_max_attempts: 3,
            init_retry_delay: Duration::from_secs(2),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            detect_container: true,
            container_host: "couchdb".to_string(),
            url_env_var: "DOCUMENT_STORE_URL".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl PoolConfig {
    /// Every database the pool owns a handle for: configuration database,
    /// each repository, and each repository's archive.
    pub fn database_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(1 + self.repositories.len() * 2);
        names.push(self.config_database.clone());
        for repository in &self.repositories {
            names.push(repository.clone());
            if !self.archive_suffix.is_empty() {
                names.push(format!("{}{}", repository, self.archive_suffix));
            }
        }
        names.dedup();
        names
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file first
        if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
            config = Self::from_file(DEFAULT_CONFIG_FILE)?;
        }

        // Override with environment variables
        config.apply_env_overrides(|key| std::env::var(key).ok())?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Store overrides
        if let Some(url) = lookup("CMIS_STORE_URL") {
            self.store.url = url;
        }

        if let Some(username) = lookup("CMIS_STORE_USERNAME") {
            self.store.username = Some(username);
        }

        if let Some(password) = lookup("CMIS_STORE_PASSWORD") {
            self.store.password = Some(password);
        }

        if let Some(enabled) = lookup("CMIS_STORE_AUTH_ENABLED") {
            self.store.auth_enabled = enabled
                .parse()
                .map_err(|e| Error::config(format!("Invalid auth flag: {}", e)))?;
        }

        if let Some(size) = lookup("CMIS_BULK_CHUNK_SIZE") {
            self.store.bulk_chunk_size = size
                .parse()
                .map_err(|e| Error::config(format!("Invalid bulk chunk size: {}", e)))?;
        }

        // Pool overrides
        if let Some(repositories) = lookup("CMIS_REPOSITORIES") {
            self.pool.repositories = repositories
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
        }

        // Logging overrides
        if let Some(level) = lookup("CMIS_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("CMIS_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.store.url)
            .map_err(|e| Error::config(format!("Invalid store URL {}: {}", self.store.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config("Store URL must use http or https"));
        }

        if self.store.bulk_chunk_size == 0 {
            return Err(Error::config("Bulk chunk size must be at least 1"));
        }

        if self.store.auth_enabled && self.store.username.as_deref().unwrap_or("").is_empty() {
            return Err(Error::config("Authentication enabled without a username"));
        }

        if self.pool.init_max_attempts == 0 {
            return Err(Error::config("Pool needs at least one initialization attempt"));
        }

        if self.pool.repositories.is_empty() {
            return Err(Error::config("No repositories configured"));
        }

        // Validate log level
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }
}

// Custom deserializer for Duration from string
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a duration string like '30s' or '5m', or whole seconds")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            parse_duration(value).map_err(E::custom)
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("negative duration"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", value.as_millis()))
}

/// Simple duration parser for common formats
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}
