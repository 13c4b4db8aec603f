//! Runtime configuration resolved from environment variables.
//!
//! `serve` CLI flags override the environment; both funnel through
//! [`ProxyConfig::from_env`].

use multiclaude_types::ConfigError;
use std::path::PathBuf;

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Shared secret clients must present (x-api-key or bearer).
    pub api_key: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Bind address.
    pub bind_address: String,
    /// Verbose logging.
    pub debug: bool,
    /// Whether model fallback is permitted when a pool is exhausted.
    pub enable_fallback: bool,
    /// Soft-limit threshold override; falls back to the stored settings.
    pub soft_limit_threshold: Option<f64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_sec: u64,
    /// HTTP write timeout in seconds.
    pub write_timeout_sec: u64,
    /// HTTP idle timeout in seconds.
    pub idle_timeout_sec: u64,
    /// Allowed CORS origins; empty means allow any.
    pub cors_origins: Vec<String>,
    /// Path of the persisted accounts document.
    pub accounts_path: PathBuf,
}

impl ProxyConfig {
    /// Resolve configuration from the environment. `PROXY_API_KEY` is
    /// required; an invalid `SOFT_LIMIT_THRESHOLD` is a startup error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("PROXY_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let soft_limit_threshold = match std::env::var("SOFT_LIMIT_THRESHOLD") {
            Ok(raw) => {
                let value: f64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "SOFT_LIMIT_THRESHOLD".to_string(),
                    value: raw.clone(),
                })?;
                if !(0.0..=1.0).contains(&value) || value.is_nan() {
                    return Err(ConfigError::InvalidThreshold { value });
                }
                Some(value)
            }
            Err(_) => None,
        };

        Ok(Self {
            api_key,
            port: env_parse("PORT", 8080)?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            debug: env_flag("DEBUG"),
            enable_fallback: env_flag("ENABLE_FALLBACK"),
            soft_limit_threshold,
            read_timeout_sec: env_parse("READ_TIMEOUT_SEC", 300)?,
            write_timeout_sec: env_parse("WRITE_TIMEOUT_SEC", 300)?,
            idle_timeout_sec: env_parse("IDLE_TIMEOUT_SEC", 120)?,
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            accounts_path: accounts_config_path(),
        })
    }
}

/// Resolve the accounts document path: `ACCOUNTS_CONFIG_PATH` override, else
/// `~/.config/multiclaude/accounts.json`.
pub fn accounts_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ACCOUNTS_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multiclaude")
        .join("accounts.json")
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
