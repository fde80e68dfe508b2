// src/config.rs

use std::{env, fmt, str::FromStr, time::Duration};

use dotenvy::dotenv;

/// Default number of violations of one kind that forces submission.
pub const DEFAULT_VIOLATION_THRESHOLD: u32 = 3;

/// Default cap on leaderboard size.
pub const LEADERBOARD_LIMIT: i64 = 50;

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{} must be set", key),
            ConfigError::Invalid { key, value } => {
                write!(f, "{} has invalid value '{}'", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub rust_log: String,
    pub bind_addr: String,
    /// Directory holding the per-attempt shadow files.
    pub shadow_dir: String,
    pub engine: EngineConfig,
}

/// Tuning knobs for a running exam session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub violation_threshold: u32,
    /// A visibility loss this soon after a handheld rotation is ignored.
    pub orientation_grace: Duration,
    pub tick_interval: Duration,
    pub reconcile_interval: Duration,
    pub store_timeout: Duration,
    /// Extra attempts for a failed answer save before rolling back.
    pub save_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            violation_threshold: DEFAULT_VIOLATION_THRESHOLD,
            orientation_grace: Duration::from_millis(1500),
            tick_interval: Duration::from_millis(1000),
            reconcile_interval: Duration::from_millis(5000),
            store_timeout: Duration::from_millis(5000),
            save_retries: 2,
            retry_base: Duration::from_millis(250),
            retry_max: Duration::from_millis(30_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let shadow_dir = env::var("SHADOW_DIR").unwrap_or_else(|_| ".shadow".to_string());

        Ok(Self {
            database_url,
            jwt_secret,
            rust_log,
            bind_addr,
            shadow_dir,
            engine: EngineConfig::from_env()?,
        })
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            violation_threshold: parse_or("VIOLATION_THRESHOLD", defaults.violation_threshold)?,
            orientation_grace: millis_or("ORIENTATION_GRACE_MS", defaults.orientation_grace)?,
            tick_interval: millis_or("TICK_INTERVAL_MS", defaults.tick_interval)?,
            reconcile_interval: millis_or("RECONCILE_INTERVAL_MS", defaults.reconcile_interval)?,
            store_timeout: millis_or("STORE_TIMEOUT_MS", defaults.store_timeout)?,
            save_retries: parse_or("SAVE_RETRIES", defaults.save_retries)?,
            retry_base: millis_or("RETRY_BASE_MS", defaults.retry_base)?,
            retry_max: millis_or("RETRY_MAX_MS", defaults.retry_max)?,
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn millis_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
