//! Router Configuration Module
//!
//! Provides configuration loading and validation for the request router.
//! Supports loading from TOML files with environment variable overrides.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix used by [`RouterConfig::load`]
pub const ENV_PREFIX: &str = "ROUTER";

/// Largest `retry.max_attempts` whose backoff still doubles on every attempt
pub const MAX_RETRY_ATTEMPTS: u32 = 31;

/// Policy for per-item errors on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorBehaviour {
    /// Any fatal per-item error fails the whole request
    #[default]
    Raise,
    /// Return partial data alongside the error list; erroring items are
    /// present with null placeholders
    Return,
    /// Return partial data alongside the error list; erroring items are
    /// absent from the data
    Skip,
}

impl ErrorBehaviour {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorBehaviour::Raise => "raise",
            ErrorBehaviour::Return => "return",
            ErrorBehaviour::Skip => "skip",
        }
    }
}

impl fmt::Display for ErrorBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorBehaviour {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raise" => Ok(ErrorBehaviour::Raise),
            "return" => Ok(ErrorBehaviour::Return),
            "skip" | "ignore" => Ok(ErrorBehaviour::Skip),
            other => Err(format!(
                "unknown error behaviour '{}', expected raise, return or skip",
                other
            )),
        }
    }
}

impl TryFrom<String> for ErrorBehaviour {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ErrorBehaviour> for String {
    fn from(value: ErrorBehaviour) -> Self {
        value.as_str().to_string()
    }
}

/// Retry policy for throttled requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of resubmissions of a throttled sub-request
    pub max_attempts: u32,
    /// Delay before the first resubmission; doubles on every further attempt
    pub base_backoff_ms: u64,
    /// Upper bound of the random jitter added to each delay
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            jitter_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

/// Session lifecycle timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long to wait for `SessionStarted` after opening the session
    pub connect_timeout_ms: u64,
    /// How long to wait for `ServiceOpened` after asking for a service
    pub service_timeout_ms: u64,
    /// Blocking receive timeout used by the event pump between shutdown checks
    pub poll_interval_ms: u64,
    /// How long `stop()` waits for in-flight requests and the pump
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            service_timeout_ms: 10_000,
            poll_interval_ms: 100,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Error classification tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Vendor subcategories that are recorded but never fail a request
    pub ignorable_subcategories: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ignorable_subcategories: vec![
                "NOT_APPLICABLE_TO_REF_DATA".to_string(),
                "NOT_APPLICABLE_TO_HIST_DATA".to_string(),
            ],
        }
    }
}

/// Main router configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub error_behaviour: ErrorBehaviour,

    /// `tracing` filter directive, e.g. `info` or `request_router=debug`
    pub log_level: String,

    /// Securities per reference-data sub-request; larger batches are split
    pub max_securities_per_request: usize,

    /// Updates buffered per subscription; while full, newly arriving updates
    /// are dropped and counted
    pub subscription_buffer: usize,

    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub classifier: ClassifierConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            error_behaviour: ErrorBehaviour::Raise,
            log_level: "info".to_string(),
            max_securities_per_request: 50,
            subscription_buffer: 1024,
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from an optional file with `ROUTER__` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load configuration using a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading router config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("classifier.ignorable_subcategories"),
        );

        let config: RouterConfig = builder
            .build()
            .context("Failed to build router configuration")?
            .try_deserialize()
            .context("Failed to deserialize router configuration")?;

        config.validate()?;
        debug!(?config, "Router configuration loaded");
        Ok(config)
    }

    /// Reject values the router cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_securities_per_request == 0 {
            bail!("max_securities_per_request must be greater than 0");
        }

        if self.subscription_buffer == 0 {
            bail!("subscription_buffer must be greater than 0");
        }

        if self.retry.max_attempts > MAX_RETRY_ATTEMPTS {
            bail!(
                "retry.max_attempts must be at most {} (got {})",
                MAX_RETRY_ATTEMPTS,
                self.retry.max_attempts
            );
        }

        if self.session.poll_interval_ms == 0 {
            bail!("session.poll_interval_ms must be greater than 0");
        }

        tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("Invalid log_level '{}'", self.log_level))?;

        Ok(())
    }

    pub fn with_error_behaviour(mut self, behaviour: ErrorBehaviour) -> Self {
        self.error_behaviour = behaviour;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_error_behaviour_parsing() {
        assert_eq!("RAISE".parse::<ErrorBehaviour>().unwrap(), ErrorBehaviour::Raise);
        assert_eq!(" return ".parse::<ErrorBehaviour>().unwrap(), ErrorBehaviour::Return);
        assert_eq!("skip".parse::<ErrorBehaviour>().unwrap(), ErrorBehaviour::Skip);
        assert!("explode".parse::<ErrorBehaviour>().is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.error_behaviour, ErrorBehaviour::Raise);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_load_file_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("router.toml");

        let config_content = r#"
error_behaviour = "return"
log_level = "debug"
max_securities_per_request = 10

[retry]
max_attempts = 5
base_backoff_ms = 100

[session]
connect_timeout_ms = 2000
"#;

        fs::write(&config_path, config_content).unwrap();

        let config =
            RouterConfig::load_with_prefix(Some(&config_path), "ROUTER_TEST_FILE").unwrap();
        assert_eq!(config.error_behaviour, ErrorBehaviour::Return);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_securities_per_request, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_backoff(), Duration::from_millis(100));
        // unspecified keys keep their defaults
        assert_eq!(config.retry.jitter_ms, RetryConfig::default().jitter_ms);
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.session.poll_interval_ms, 100);
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("ROUTER_TEST_ENV__ERROR_BEHAVIOUR", "SKIP");
        std::env::set_var("ROUTER_TEST_ENV__RETRY__MAX_ATTEMPTS", "7");
        std::env::set_var(
            "ROUTER_TEST_ENV__CLASSIFIER__IGNORABLE_SUBCATEGORIES",
            "A,B",
        );

        let config = RouterConfig::load_with_prefix(None, "ROUTER_TEST_ENV").unwrap();
        assert_eq!(config.error_behaviour, ErrorBehaviour::Skip);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(
            config.classifier.ignorable_subcategories,
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("router.toml");
        fs::write(&config_path, "max_securities_per_request = 0\n").unwrap();

        let err = RouterConfig::load_with_prefix(Some(&config_path), "ROUTER_TEST_INVALID")
            .unwrap_err();
        assert!(err.to_string().contains("max_securities_per_request"));
    }

    #[test]
    fn test_retry_attempts_bounded() {
        let mut config = RouterConfig::default();
        config.retry.max_attempts = MAX_RETRY_ATTEMPTS;
        assert!(config.validate().is_ok());

        config.retry.max_attempts = MAX_RETRY_ATTEMPTS + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.max_attempts"));
    }

    #[test]
    fn test_serializes_to_toml() {
        let config = RouterConfig::default().with_error_behaviour(ErrorBehaviour::Skip);
        let rendered = toml::to_string(&config).unwrap();
        assert!(rendered.contains("error_behaviour = \"skip\""));
    }
}
