//! Multi-tier TOML configuration for Parley.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_api::{DEFAULT_MODEL_TTL, DEFAULT_OPENAI_BASE_URL, HttpConfig, RetryConfig};
use parley_types::ConfigError;
use serde::{Deserialize, Serialize};

/// The default model to use.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// The default max tokens for a response.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// The default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Resolved configuration for a Parley session.
#[derive(Debug, Clone)]
pub struct ParleyConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub retry: RetryConfig,
    pub http: HttpConfig,
    pub model_ttl: Duration,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub exponent_base: Option<f64>,
    pub jitter_max_ms: Option<u64>,
    pub retryable_status_codes: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpSettings {
    pub pool_max_idle_per_host: Option<usize>,
    pub pool_idle_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    pub model_ttl_secs: Option<u64>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl ParleyConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables
    /// 3. Config file (~/.parley/config.toml)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let config_dir = config_dir();
        let settings = load_settings_file(&config_dir.join("config.toml"));
        Self::resolve(overrides, settings, config_dir, |key| std::env::var(key).ok())
    }

    /// Resolve a config from already-loaded sources. `env` looks up an
    /// environment variable.
    pub fn resolve(
        overrides: CliOverrides,
        settings: SettingsFile,
        config_dir: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let provider = settings.provider;

        // Resolve API key: CLI > env > config file
        let api_key = overrides
            .api_key
            .or_else(|| env("PARLEY_API_KEY"))
            .or_else(|| env("OPENAI_API_KEY"))
            .or(provider.api_key)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingKey {
                key: "api_key (set PARLEY_API_KEY or add to ~/.parley/config.toml)".into(),
            })?;

        let model = overrides
            .model
            .or_else(|| env("PARLEY_MODEL"))
            .or(provider.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let base_url = overrides
            .base_url
            .or_else(|| env("PARLEY_BASE_URL"))
            .or(provider.base_url)
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());

        let max_tokens = overrides
            .max_tokens
            .or(provider.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        if max_tokens == 0 {
            return Err(invalid("max_tokens", "must be greater than zero"));
        }

        let temperature = overrides
            .temperature
            .or(provider.temperature)
            .unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(invalid(
                "temperature",
                format!("{temperature} is outside 0.0..=2.0"),
            ));
        }

        Ok(ParleyConfig {
            api_key,
            base_url,
            model,
            max_tokens,
            temperature,
            retry: settings.retry.into_config()?,
            http: settings.http.into_config(),
            model_ttl: settings
                .cache
                .model_ttl_secs
                .map_or(DEFAULT_MODEL_TTL, Duration::from_secs),
            config_dir,
        })
    }
}

impl RetrySettings {
    /// Overlay these settings on the default retry policy and validate it.
    pub fn into_config(self) -> Result<RetryConfig, ConfigError> {
        let defaults = RetryConfig::default();
        let config = RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self
                .base_delay_ms
                .map_or(defaults.base_delay, Duration::from_millis),
            max_delay: self
                .max_delay_ms
                .map_or(defaults.max_delay, Duration::from_millis),
            exponent_base: self.exponent_base.unwrap_or(defaults.exponent_base),
            jitter_max: self
                .jitter_max_ms
                .map_or(defaults.jitter_max, Duration::from_millis),
            retryable_status_codes: self
                .retryable_status_codes
                .map_or(defaults.retryable_status_codes, HashSet::from_iter),
        };

        if !config.exponent_base.is_finite() || config.exponent_base < 1.0 {
            return Err(invalid(
                "retry.exponent_base",
                format!("{} must be at least 1.0", config.exponent_base),
            ));
        }
        if config.max_delay < config.base_delay {
            return Err(invalid(
                "retry.max_delay_ms",
                "must not be less than retry.base_delay_ms",
            ));
        }
        Ok(config)
    }
}

impl HttpSettings {
    pub fn into_config(self) -> HttpConfig {
        let defaults = HttpConfig::default();
        HttpConfig {
            pool_max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(defaults.pool_max_idle_per_host),
            pool_idle_timeout: self
                .pool_idle_timeout_secs
                .map_or(defaults.pool_idle_timeout, Duration::from_secs),
            connect_timeout: self
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Get the Parley config directory path (~/.parley/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PARLEY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

/// Load and parse a TOML settings file, returning defaults on any error.
pub fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
