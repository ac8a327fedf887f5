//! Configuration structs for the subflow services.
//!
//! Every component takes its configuration struct through its constructor;
//! nothing reads the environment after startup. `from_env` constructors
//! exist so binaries can assemble the whole tree in one call.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Top-level configuration for the identity core and worker.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub abuse: AbuseConfig,
    pub tenant_api: TenantApiConfig,
    pub backfill: BackfillConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            abuse: AbuseConfig::from_env()?,
            tenant_api: TenantApiConfig::from_env()?,
            backfill: BackfillConfig::from_env()?,
        })
    }
}

/// Signup abuse-gating thresholds.
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// Attempts allowed per correlated key inside the tracking window.
    /// Zero or negative means "block on first repeat".
    pub max_attempts: i64,
    /// Trailing window, in days, that attempts count toward the threshold.
    /// Zero is honored literally (only same-instant attempts count).
    pub tracking_window_days: i64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            tracking_window_days: 30,
        }
    }
}

impl AbuseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: parse_or("ABUSE_MAX_ATTEMPTS", defaults.max_attempts)?,
            tracking_window_days: parse_or(
                "ABUSE_TRACKING_WINDOW_DAYS",
                defaults.tracking_window_days,
            )?,
        })
    }
}

/// Connection settings for the external tenant directory API.
#[derive(Debug, Clone)]
pub struct TenantApiConfig {
    /// Base URL of the tenant API, without a trailing path.
    pub base_url: String,
    /// Subscription key sent on every request.
    pub subscription_key: String,
    /// Region code the external system expects on tenant creation.
    pub region_code: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Automatic retries after the initial attempt, transient failures only.
    pub max_retries: usize,
    pub retry_backoff_ms: u64,
}

impl TenantApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: require("TENANT_API_BASE_URL")?,
            subscription_key: require("TENANT_API_SUBSCRIPTION_KEY")?,
            region_code: std::env::var("TENANT_API_REGION_CODE").unwrap_or_else(|_| "86".into()),
            connect_timeout_secs: parse_or("TENANT_API_CONNECT_TIMEOUT_SECS", 15)?,
            request_timeout_secs: parse_or("TENANT_API_REQUEST_TIMEOUT_SECS", 30)?,
            max_retries: parse_or("TENANT_API_MAX_RETRIES", 3)?,
            retry_backoff_ms: parse_or("TENANT_API_RETRY_BACKOFF_MS", 1000)?,
        })
    }
}

/// Batch sizing for the sync backfill jobs.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Default row cap applied when a run does not specify its own limit.
    pub batch_limit: i64,
    /// Maximum failure details kept in a backfill report.
    pub error_sample_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_limit: 200,
            error_sample_size: 10,
        }
    }
}

impl BackfillConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            batch_limit: parse_or("BACKFILL_BATCH_LIMIT", defaults.batch_limit)?,
            error_sample_size: parse_or("BACKFILL_ERROR_SAMPLE_SIZE", defaults.error_sample_size)?,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

/// Parse an optional env var, falling back to `default` when unset.
/// A value that is present but unparseable is a hard error, not a default.
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(default),
    }
}
