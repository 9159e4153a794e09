//! Environment-driven application configuration.

use crate::{Error, Result};

/// Default resolution cache lifetime in seconds.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 7200;

/// How long the first strategy runs alone before the second joins the race.
pub const DEFAULT_STAGE_WINDOW_MS: u64 = 3000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    /// Directory manifests and encryption keys are stored under.
    pub artifact_dir: String,
    /// Public base URL under which stored artifacts are served.
    pub public_base_url: String,

    /// Paid resolution endpoint.
    pub paid_endpoint: String,
    /// Free API endpoint authenticated by the shared parameter.
    pub shared_api_url: String,
    /// Gateway page prefix the video URL is appended to.
    pub shared_gateway_url: String,
    /// Player site root used by the derivation strategy.
    pub derive_gateway_url: String,
    /// File the shared parameter is persisted in across restarts.
    pub shared_param_file: String,
    /// External browser-capture command, e.g. "node capture.js". Empty
    /// disables browser capture.
    pub capture_command: String,

    pub cache_ttl_secs: i64,
    pub stage_window_ms: u64,
    /// Extra paid-endpoint attempts after the first.
    pub paid_max_retries: u32,
    /// Shared parameter validity window.
    pub shared_param_max_age_secs: i64,
    /// Redirect/indirection hop bound for the derivation strategy.
    pub derive_max_hops: u32,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("{key} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: env_or("DATABASE_URL", "sqlite:vod-relay.db?mode=rwc"),
            log_dir: env_or("VOD_RELAY_LOG_DIR", "logs"),
            artifact_dir: env_or("VOD_RELAY_ARTIFACT_DIR", "data/m3u8_cache"),
            public_base_url: env_or(
                "VOD_RELAY_PUBLIC_BASE_URL",
                "http://localhost:8000/api/v1/m3u8",
            ),
            paid_endpoint: env_or("VOD_RELAY_PAID_ENDPOINT", ""),
            shared_api_url: env_or("VOD_RELAY_SHARED_API_URL", ""),
            shared_gateway_url: env_or("VOD_RELAY_SHARED_GATEWAY_URL", ""),
            derive_gateway_url: env_or("VOD_RELAY_DERIVE_GATEWAY_URL", ""),
            shared_param_file: env_or("VOD_RELAY_SHARED_PARAM_FILE", "data/shared_param.json"),
            capture_command: env_or("VOD_RELAY_CAPTURE_COMMAND", ""),
            cache_ttl_secs: env_parsed("VOD_RELAY_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?,
            stage_window_ms: env_parsed("VOD_RELAY_STAGE_WINDOW_MS", DEFAULT_STAGE_WINDOW_MS)?,
            paid_max_retries: env_parsed("VOD_RELAY_PAID_MAX_RETRIES", 2)?,
            shared_param_max_age_secs: env_parsed(
                "VOD_RELAY_SHARED_PARAM_MAX_AGE_SECS",
                24 * 60 * 60,
            )?,
            derive_max_hops: env_parsed("VOD_RELAY_DERIVE_MAX_HOPS", 5)?,
        };

        if config.paid_endpoint.is_empty()
            && config.shared_api_url.is_empty()
            && config.derive_gateway_url.is_empty()
        {
            return Err(Error::config(
                "no resolution strategy is configured; set at least one endpoint",
            ));
        }

        Ok(config)
    }

    /// The capture command split into program and arguments, if configured.
    pub fn capture_parts(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.capture_command.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some((program, parts.collect()))
    }
}
