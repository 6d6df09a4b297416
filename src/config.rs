use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use validator::Validate;

const DEFAULT_ENV: &str = "development";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_BACKOFF_MS: u64 = 25;
const CONFIG_DIR: &str = "config";

/// Policy governing whether a picking session may advance to packing
/// before every product reached its required quantity.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartialFulfillmentPolicy {
    /// Shortfalls block `finish_picking` outright.
    #[default]
    Disallowed,
    /// Shortfalls are allowed when the caller passes an explicit
    /// acknowledgement; the shortfall is recorded on the emitted event.
    WithAcknowledgement,
}

/// Retry behavior for transient write conflicts (CAS failures,
/// lock-wait timeouts). Applied only to `ConcurrencyConflict` errors.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct RetryConfig {
    /// Maximum attempts before the conflict is surfaced to the caller.
    #[serde(default = "default_retry_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,

    /// Base backoff between attempts; doubled per attempt with jitter.
    #[serde(default = "default_retry_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_backoff_ms: default_retry_base_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Deployment environment name ("development", "test", "production")
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Maximum number of pooled database connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 200))]
    pub db_max_connections: u32,

    /// Minimum number of pooled database connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Run migrations automatically on connection
    #[serde(default)]
    pub auto_migrate: bool,

    /// Retry policy for transient conflicts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Whether sessions may advance to packing with unpicked units
    #[serde(default)]
    pub partial_fulfillment: PartialFulfillmentPolicy,
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_retry_base_backoff_ms() -> u64 {
    DEFAULT_RETRY_BASE_BACKOFF_MS
}

impl AppConfig {
    /// Direct constructor, used by tests and embedding applications.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            auto_migrate: false,
            retry: RetryConfig::default(),
            partial_fulfillment: PartialFulfillmentPolicy::default(),
        }
    }

    /// Loads configuration from layered sources: `config/default.toml`,
    /// `config/{environment}.toml`, then `FULFILLMENT_*` environment
    /// variables, each layer overriding the previous.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("FULFILLMENT_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let mut builder = Config::builder();

        let default_path = Path::new(CONFIG_DIR).join("default.toml");
        if default_path.exists() {
            builder = builder.add_source(File::from(default_path));
        }

        let env_path = Path::new(CONFIG_DIR).join(format!("{environment}.toml"));
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path));
        }

        builder = builder.add_source(Environment::with_prefix("FULFILLMENT").separator("__"));

        let config: AppConfig = builder.build()?.try_deserialize()?;

        config
            .validate()
            .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

        info!(environment = %config.environment, "Configuration loaded");
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert_eq!(cfg.db_max_connections, DEFAULT_DB_MAX_CONNECTIONS);
        assert_eq!(cfg.retry.max_attempts, DEFAULT_RETRY_MAX_ATTEMPTS);
        assert_eq!(cfg.partial_fulfillment, PartialFulfillmentPolicy::Disallowed);
        assert!(!cfg.is_production());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn retry_backoff_converts_to_duration() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_backoff_ms: 40,
        };
        assert_eq!(retry.base_backoff(), Duration::from_millis(40));
    }
}
