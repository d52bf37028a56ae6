//! Configuration management for Shutter
//!
//! Values come from the environment (optionally seeded from a `.env` file by
//! the binary). Unset variables fall back to defaults; set-but-unparseable
//! variables are an error.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::manifest::ChunkSizePolicy;
use crate::retry::RetryPolicy;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

/// Client-side pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base URL of the upload authority API
    pub authority_url: String,
    /// Reported in manifest metadata
    pub client_version: String,
    /// Files transferred in parallel
    pub max_concurrent_files: usize,
    pub chunk_policy: ChunkSizePolicy,
    /// Total negotiation attempts before failing the batch
    pub negotiation_attempts: u32,
    /// Re-negotiations allowed after a session expires mid-transfer
    pub renegotiation_limit: u32,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
}

/// Reference upload authority settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL used to build transfer destinations
    pub public_url: String,
    pub session_ttl_secs: i64,
    pub max_chunk_size: u64,
    pub allowed_retries: u32,
    pub max_file_size: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            authority_url: "http://localhost:3000/api/v1/uploads".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            max_concurrent_files: 4,
            chunk_policy: ChunkSizePolicy::default(),
            negotiation_attempts: 3,
            renegotiation_limit: 2,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_url: "http://localhost:3000".to_string(),
            session_ttl_secs: 3600,
            max_chunk_size: 8 * 1024 * 1024,
            allowed_retries: 3,
            max_file_size: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pipeline: PipelineConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pipeline_defaults = PipelineConfig::default();
        let server_defaults = ServerConfig::default();

        let base_delay_ms: u64 = parse(&lookup, "SHUTTER_RETRY_BASE_MS", 500)?;
        let max_delay_ms: u64 = parse(&lookup, "SHUTTER_RETRY_MAX_MS", 8_000)?;
        let timeout_secs: u64 = parse(&lookup, "SHUTTER_REQUEST_TIMEOUT_SECS", 60)?;

        let pipeline = PipelineConfig {
            authority_url: lookup("SHUTTER_AUTHORITY_URL")
                .unwrap_or(pipeline_defaults.authority_url),
            client_version: lookup("SHUTTER_CLIENT_VERSION")
                .unwrap_or(pipeline_defaults.client_version),
            max_concurrent_files: parse(
                &lookup,
                "SHUTTER_MAX_CONCURRENT_FILES",
                pipeline_defaults.max_concurrent_files,
            )?
            .max(1),
            chunk_policy: ChunkSizePolicy {
                fast: parse(
                    &lookup,
                    "SHUTTER_CHUNK_SIZE_FAST",
                    pipeline_defaults.chunk_policy.fast,
                )?,
                constrained: parse(
                    &lookup,
                    "SHUTTER_CHUNK_SIZE_CONSTRAINED",
                    pipeline_defaults.chunk_policy.constrained,
                )?,
            },
            negotiation_attempts: parse(
                &lookup,
                "SHUTTER_NEGOTIATION_ATTEMPTS",
                pipeline_defaults.negotiation_attempts,
            )?,
            renegotiation_limit: parse(
                &lookup,
                "SHUTTER_RENEGOTIATION_LIMIT",
                pipeline_defaults.renegotiation_limit,
            )?,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
            },
            request_timeout: Duration::from_secs(timeout_secs),
        };

        let port = parse(&lookup, "SERVER_PORT", server_defaults.port)?;
        let server = ServerConfig {
            host: lookup("SERVER_HOST").unwrap_or(server_defaults.host),
            port,
            public_url: lookup("SHUTTER_PUBLIC_URL")
                .unwrap_or_else(|| format!("http://localhost:{}", port)),
            session_ttl_secs: parse(
                &lookup,
                "SHUTTER_SESSION_TTL_SECS",
                server_defaults.session_ttl_secs,
            )?,
            max_chunk_size: parse(
                &lookup,
                "SHUTTER_MAX_CHUNK_SIZE",
                server_defaults.max_chunk_size,
            )?,
            allowed_retries: parse(
                &lookup,
                "SHUTTER_ALLOWED_RETRIES",
                server_defaults.allowed_retries,
            )?,
            max_file_size: parse(
                &lookup,
                "SHUTTER_MAX_FILE_SIZE",
                server_defaults.max_file_size,
            )?,
        };

        Ok(Config { pipeline, server })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.pipeline.max_concurrent_files, 4);
        assert_eq!(config.pipeline.chunk_policy.fast, 5 * 1024 * 1024);
        assert_eq!(config.pipeline.chunk_policy.constrained, 2 * 1024 * 1024);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.public_url, "http://localhost:3000");
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("SHUTTER_MAX_CONCURRENT_FILES", "8"),
            ("SHUTTER_RETRY_BASE_MS", "50"),
            ("SERVER_PORT", "8088"),
            ("SHUTTER_AUTHORITY_URL", "https://uploads.example.com/api/v1/uploads"),
        ]))
        .unwrap();

        assert_eq!(config.pipeline.max_concurrent_files, 8);
        assert_eq!(config.pipeline.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.public_url, "http://localhost:8088");
        assert_eq!(
            config.pipeline.authority_url,
            "https://uploads.example.com/api/v1/uploads"
        );
    }

    #[test]
    fn test_concurrency_floor() {
        let config =
            Config::from_lookup(lookup_from(&[("SHUTTER_MAX_CONCURRENT_FILES", "0")])).unwrap();
        assert_eq!(config.pipeline.max_concurrent_files, 1);
    }

    #[test]
    fn test_invalid_value() {
        let err = Config::from_lookup(lookup_from(&[("SERVER_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SERVER_PORT", .. }));
    }
}
