//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Candidates processed per resolve call when the caller gives no limit
    pub resolve_default_limit: usize,
    /// Upper bound for a caller-supplied limit
    pub resolve_max_limit: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let resolve_default_limit = parse_limit("RESOLVE_DEFAULT_LIMIT", 100)?;
        let resolve_max_limit = parse_limit("RESOLVE_MAX_LIMIT", 1000)?;

        Ok(Self {
            host,
            port,
            database_url,
            resolve_default_limit: resolve_default_limit.min(resolve_max_limit),
            resolve_max_limit,
        })
    }

    /// Clamp a caller-supplied resolve limit.
    pub fn resolve_limit(&self, requested: Option<usize>) -> usize {
        requested
            .map(|limit| limit.clamp(1, self.resolve_max_limit))
            .unwrap_or(self.resolve_default_limit)
    }
}

fn parse_limit(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(value) => match value.parse::<usize>() {
            Ok(limit) if limit > 0 => Ok(limit),
            _ => Err(ConfigError::InvalidLimit(name)),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value, expected a positive integer")]
    InvalidLimit(&'static str),
}
