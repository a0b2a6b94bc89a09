//! Main application configuration
//!
//! This module defines the primary configuration structures for the heart-link
//! matchmaking service, including environment variable / TOML loading and
//! validation.

use crate::error::MatchmakingError;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub store: StoreSettings,
    pub matching: MatchingSettings,
    pub reaper: ReaperSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port for health check and metrics endpoints
    pub health_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
    /// How often matching statistics are pushed into the metrics registry
    pub stats_refresh_seconds: u64,
}

/// Which `MatchStore` backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(anyhow!("Invalid store backend: {}", other)),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Database file used by the sqlite backend
    pub sqlite_path: PathBuf,
    /// How long sqlite waits on a locked database before reporting contention
    pub busy_timeout_ms: u64,
}

/// Matching protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    /// Pending requests older than this are expired
    pub pending_ttl_seconds: u64,
    /// Matched requests older than this are expired
    pub matched_ttl_seconds: u64,
    /// How many of the oldest candidates are re-ordered by score
    pub candidate_window: usize,
    /// Upper bound on candidates examined in one attempt
    pub max_candidates: usize,
    /// Score jitter is drawn uniformly from [-range, range]
    pub score_jitter: i64,
    /// Retries of the pairing commit after transient contention
    pub commit_retry_attempts: u32,
    /// Linear backoff step between commit retries in milliseconds
    pub commit_retry_backoff_ms: u64,
    /// Requesters seen within this window are listed as available
    pub online_window_seconds: u64,
}

/// Expiry reaper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub enabled: bool,
    /// Sweep cadence in seconds
    pub interval_seconds: u64,
    /// Random delay added to each tick, up to this many seconds
    pub jitter_seconds: u64,
    /// Active sessions younger than this are never ended for inactivity
    pub session_grace_seconds: u64,
    /// Both participants must be idle this long for a session to end
    pub inactivity_threshold_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "heart-link".to_string(),
            log_level: "info".to_string(),
            health_port: 8080,
            shutdown_timeout_seconds: 30,
            stats_refresh_seconds: 30,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: PathBuf::from("heart_link.db"),
            busy_timeout_ms: 250,
        }
    }
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            pending_ttl_seconds: 600,  // 10 minutes
            matched_ttl_seconds: 3600, // 60 minutes
            candidate_window: 3,
            max_candidates: 50,
            score_jitter: 20,
            commit_retry_attempts: 3,
            commit_retry_backoff_ms: 25,
            online_window_seconds: 300, // 5 minutes
        }
    }
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300, // 5 minutes
            jitter_seconds: 30,
            session_grace_seconds: 300,          // 5 minutes
            inactivity_threshold_seconds: 1800, // 30 minutes
        }
    }
}

/// Parse an environment variable into `target` if it is set
fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) -> Result<()> {
    if let Ok(raw) = env::var(key) {
        *target = raw
            .parse()
            .map_err(|_| anyhow!("Invalid {} value: {}", key, raw))?;
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file; environment variables still win
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        override_from_env("SERVICE_NAME", &mut self.service.name)?;
        override_from_env("LOG_LEVEL", &mut self.service.log_level)?;
        override_from_env("HEALTH_PORT", &mut self.service.health_port)?;
        override_from_env(
            "SHUTDOWN_TIMEOUT_SECONDS",
            &mut self.service.shutdown_timeout_seconds,
        )?;
        override_from_env(
            "STATS_REFRESH_SECONDS",
            &mut self.service.stats_refresh_seconds,
        )?;

        // Store settings
        override_from_env("STORE_BACKEND", &mut self.store.backend)?;
        override_from_env("SQLITE_PATH", &mut self.store.sqlite_path)?;
        override_from_env("SQLITE_BUSY_TIMEOUT_MS", &mut self.store.busy_timeout_ms)?;

        // Matching settings
        override_from_env("PENDING_TTL_SECONDS", &mut self.matching.pending_ttl_seconds)?;
        override_from_env("MATCHED_TTL_SECONDS", &mut self.matching.matched_ttl_seconds)?;
        override_from_env("CANDIDATE_WINDOW", &mut self.matching.candidate_window)?;
        override_from_env("MAX_CANDIDATES", &mut self.matching.max_candidates)?;
        override_from_env("SCORE_JITTER", &mut self.matching.score_jitter)?;
        override_from_env(
            "COMMIT_RETRY_ATTEMPTS",
            &mut self.matching.commit_retry_attempts,
        )?;
        override_from_env(
            "COMMIT_RETRY_BACKOFF_MS",
            &mut self.matching.commit_retry_backoff_ms,
        )?;
        override_from_env(
            "ONLINE_WINDOW_SECONDS",
            &mut self.matching.online_window_seconds,
        )?;

        // Reaper settings
        override_from_env("REAPER_ENABLED", &mut self.reaper.enabled)?;
        override_from_env("REAPER_INTERVAL_SECONDS", &mut self.reaper.interval_seconds)?;
        override_from_env("REAPER_JITTER_SECONDS", &mut self.reaper.jitter_seconds)?;
        override_from_env(
            "SESSION_GRACE_SECONDS",
            &mut self.reaper.session_grace_seconds,
        )?;
        override_from_env(
            "INACTIVITY_THRESHOLD_SECONDS",
            &mut self.reaper.inactivity_threshold_seconds,
        )?;

        Ok(())
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get stats refresh interval as Duration
    pub fn stats_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.service.stats_refresh_seconds)
    }

    /// Get sqlite busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    /// Get the pending-request TTL as Duration
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.matching.pending_ttl_seconds)
    }

    /// Get the matched-request TTL as Duration
    pub fn matched_ttl(&self) -> Duration {
        Duration::from_secs(self.matching.matched_ttl_seconds)
    }

    /// Get the online window for available requests as Duration
    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.matching.online_window_seconds)
    }

    /// Get commit retry backoff step as Duration
    pub fn commit_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.matching.commit_retry_backoff_ms)
    }

    /// Get reaper interval as Duration
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_seconds)
    }

    /// Get reaper jitter bound as Duration
    pub fn reaper_jitter(&self) -> Duration {
        Duration::from_secs(self.reaper.jitter_seconds)
    }

    /// Get session grace period as Duration
    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.reaper.session_grace_seconds)
    }

    /// Get participant inactivity threshold as Duration
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.reaper.inactivity_threshold_seconds)
    }
}

macro_rules! config_error {
    ($($arg:tt)*) => {
        anyhow::Error::from(MatchmakingError::ConfigurationError {
            message: format!($($arg)*),
        })
    };
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(config_error!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.health_port == 0 {
        return Err(config_error!("Health port cannot be 0"));
    }
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(config_error!("Shutdown timeout must be greater than 0"));
    }
    if config.service.stats_refresh_seconds == 0 {
        return Err(config_error!("Stats refresh interval must be greater than 0"));
    }

    if config.store.backend == StoreBackend::Sqlite
        && config.store.sqlite_path.as_os_str().is_empty()
    {
        return Err(config_error!("Sqlite path cannot be empty"));
    }

    // Validate matching settings
    if config.matching.pending_ttl_seconds == 0 {
        return Err(config_error!("Pending TTL must be greater than 0"));
    }
    if config.matching.matched_ttl_seconds == 0 {
        return Err(config_error!("Matched TTL must be greater than 0"));
    }
    if config.matching.candidate_window == 0 {
        return Err(config_error!("Candidate window must be at least 1"));
    }
    if config.matching.max_candidates < config.matching.candidate_window {
        return Err(config_error!(
            "Max candidates ({}) cannot be smaller than the candidate window ({})",
            config.matching.max_candidates,
            config.matching.candidate_window
        ));
    }
    if config.matching.score_jitter < 0 {
        return Err(config_error!("Score jitter cannot be negative"));
    }

    if config.matching.online_window_seconds == 0 {
        return Err(config_error!("Online window must be greater than 0"));
    }

    // Validate reaper settings
    if config.reaper.interval_seconds == 0 {
        return Err(config_error!("Reaper interval must be greater than 0"));
    }
    if config.reaper.inactivity_threshold_seconds == 0 {
        return Err(config_error!("Inactivity threshold must be greater than 0"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.pending_ttl(), Duration::from_secs(600));
        assert_eq!(config.matched_ttl(), Duration::from_secs(3600));
        assert_eq!(config.reaper_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.service.log_level = "verbose".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_zero_online_window_is_rejected() {
        let mut config = AppConfig::default();
        config.matching.online_window_seconds = 0;
        assert!(validate_config(&config).is_err());
        assert_eq!(AppConfig::default().online_window(), Duration::from_secs(300));
    }

    #[test]
    fn test_window_larger_than_scan_is_rejected() {
        let mut config = AppConfig::default();
        config.matching.candidate_window = 10;
        config.matching.max_candidates = 5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [store]
            backend = "sqlite"
            sqlite_path = "/tmp/hl.db"

            [matching]
            candidate_window = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.matching.candidate_window, 5);
        assert_eq!(config.matching.pending_ttl_seconds, 600);
        assert_eq!(config.service.name, "heart-link");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!(
            "SQLite".parse::<StoreBackend>().unwrap(),
            StoreBackend::Sqlite
        );
        assert!("postgres".parse::<StoreBackend>().is_err());
    }
}
