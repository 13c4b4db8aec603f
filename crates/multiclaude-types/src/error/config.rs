//! Startup configuration errors.

use thiserror::Error;

/// Errors raised while resolving the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PROXY_API_KEY is required but not set")]
    MissingApiKey,

    #[error("Invalid soft limit threshold {value}: must be within [0, 1]")]
    InvalidThreshold { value: f64 },

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}
