//! Process configuration
//!
//! All configuration is read from the environment exactly once at startup
//! and passed around by reference. Nothing outside this module reads env
//! vars at runtime.

use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("environment variable {0} has an invalid value: {1}")]
    InvalidVar(&'static str, String),
}

/// Runtime configuration, loaded once at process start.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Shared secret for webhook signature verification (whsec_...)
    pub webhook_signing_secret: String,
    /// Port the API server listens on
    pub port: u16,
    /// Maximum connections in the database pool
    pub database_max_connections: u32,
    /// Per-acquire timeout for pool checkouts, in seconds
    pub database_acquire_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;

        let webhook_signing_secret = env::var("WEBHOOK_SIGNING_SECRET")
            .map_err(|_| ConfigError::MissingVar("WEBHOOK_SIGNING_SECRET"))?;

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidVar("PORT", raw))?,
            Err(_) => 8080,
        };

        let database_max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidVar("DATABASE_MAX_CONNECTIONS", raw))?,
            Err(_) => 5,
        };

        Ok(Self {
            database_url,
            webhook_signing_secret,
            port,
            database_max_connections,
            database_acquire_timeout_secs: 5,
        })
    }
}
