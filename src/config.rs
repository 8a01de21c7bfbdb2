//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest lifetime a payment token may be given (one year).
pub const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lifetime of a freshly issued payment token (seconds)
    pub token_ttl_secs: u64,

    /// Prefix of the scannable payload
    pub qr_prefix: String,

    /// Commit journal; `None` keeps everything in memory
    pub journal_path: Option<PathBuf>,

    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token_ttl_secs: 600,
            qr_prefix: "WPT".to_string(),
            journal_path: None,
            auth: AuthConfig::default(),
        }
    }
}

/// Credential hashing and PIN throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Argon2 memory cost (KiB)
    pub hash_memory_kib: u32,

    /// Argon2 passes
    pub hash_iterations: u32,

    /// PIN verifications allowed per user per minute
    pub pin_attempts_per_minute: u32,

    /// How often idle limiter entries are evicted (seconds)
    pub limiter_sweep_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            hash_memory_kib: 19 * 1024,
            hash_iterations: 2,
            pin_attempts_per_minute: 30,
            limiter_sweep_secs: 60,
        }
    }
}

impl AuthConfig {
    /// Cheapest valid argon2 cost, for tests and benches.
    pub fn fast() -> Self {
        Self {
            hash_memory_kib: 8,
            hash_iterations: 1,
            ..Self::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.limiter_sweep_secs.max(1))
    }
}

impl Config {
    /// Lifetime of new tokens, capped at [`MAX_TOKEN_TTL_SECS`].
    pub fn token_ttl(&self) -> chrono::Duration {
        let secs = self.token_ttl_secs.min(MAX_TOKEN_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// File (if any), then `POINTS_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("POINTS_TOKEN_TTL_SECS") {
            self.token_ttl_secs = parse_env("POINTS_TOKEN_TTL_SECS", value)?;
        }
        if let Some(value) = lookup("POINTS_QR_PREFIX") {
            self.qr_prefix = value;
        }
        if let Some(value) = lookup("POINTS_JOURNAL") {
            self.journal_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("POINTS_PIN_ATTEMPTS_PER_MINUTE") {
            self.auth.pin_attempts_per_minute =
                parse_env("POINTS_PIN_ATTEMPTS_PER_MINUTE", value)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be positive"));
        }
        if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(ConfigError::Invalid("token_ttl_secs must be at most one year"));
        }
        if self.auth.pin_attempts_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "auth.pin_attempts_per_minute must be positive",
            ));
        }
        if self.qr_prefix.contains(':') {
            return Err(ConfigError::Invalid("qr_prefix must not contain ':'"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
