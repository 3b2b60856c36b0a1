//! Client Configuration Settings
//!
//! Configuration types for the storage client, loaded from environment
//! variables.

use std::time::Duration;

use crate::application::services::{CallSettings, DEFAULT_CHUNK_SIZE, WriterOptions};
use crate::infrastructure::retry::BackoffConfig;

/// Production gRPC endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// OAuth2 access token sent as a bearer credential.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the token.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Upload defaults.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    /// Resumable chunk size in bytes (0 = one-shot uploads).
    pub chunk_size: usize,
    /// Send CRC32C checksums with uploaded data.
    pub send_crc32c: bool,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_crc32c: true,
        }
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Delay multiplier per attempt.
    pub multiplier: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            initial_delay: backoff.initial_delay,
            max_delay: backoff.max_delay,
            multiplier: backoff.multiplier,
            max_attempts: backoff.max_attempts,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// gRPC endpoint URI.
    pub endpoint: String,
    /// Whether the endpoint is a plaintext emulator.
    pub emulator: bool,
    /// Bearer token for the production service.
    pub access_token: Option<AccessToken>,
    /// Project billed for requests.
    pub user_project: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Upload defaults.
    pub writer: WriterSettings,
    /// Retry backoff.
    pub retry: RetrySettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            emulator: false,
            access_token: None,
            user_project: None,
            connect_timeout: Duration::from_secs(10),
            writer: WriterSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// `STORAGE_EMULATOR_HOST` takes precedence over
    /// `STORAGE_GRPC_ENDPOINT` and disables authentication.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable is empty or unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let (endpoint, emulator) = match non_empty_env("STORAGE_EMULATOR_HOST")? {
            Some(host) => (emulator_endpoint(&host), true),
            None => (
                non_empty_env("STORAGE_GRPC_ENDPOINT")?.unwrap_or(defaults.endpoint),
                false,
            ),
        };

        let access_token = non_empty_env("STORAGE_ACCESS_TOKEN")?.map(AccessToken::new);
        let user_project = non_empty_env("STORAGE_USER_PROJECT")?;

        let writer = WriterSettings {
            chunk_size: parse_env("STORAGE_CHUNK_SIZE_BYTES", defaults.writer.chunk_size)?,
            send_crc32c: parse_env_bool("STORAGE_SEND_CRC32C", defaults.writer.send_crc32c),
        };

        let retry = RetrySettings {
            initial_delay: parse_env_duration_millis(
                "STORAGE_RETRY_INITIAL_DELAY_MS",
                defaults.retry.initial_delay,
            )?,
            max_delay: parse_env_duration_secs(
                "STORAGE_RETRY_MAX_DELAY_SECS",
                defaults.retry.max_delay,
            )?,
            multiplier: parse_env("STORAGE_RETRY_MULTIPLIER", defaults.retry.multiplier)?,
            max_attempts: parse_env("STORAGE_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
        };

        let connect_timeout =
            parse_env_duration_secs("STORAGE_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?;

        Ok(Self {
            endpoint,
            emulator,
            access_token,
            user_project,
            connect_timeout,
            writer,
            retry,
        })
    }

    /// Backoff built from the retry settings.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.retry.initial_delay,
            max_delay: self.retry.max_delay,
            multiplier: self.retry.multiplier,
            max_attempts: self.retry.max_attempts,
            ..BackoffConfig::default()
        }
    }

    /// Call settings for a client.
    #[must_use]
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            user_project: self.user_project.clone(),
            backoff: self.backoff(),
            ..CallSettings::default()
        }
    }

    /// Writer options seeded from the upload defaults.
    #[must_use]
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            chunk_size: self.writer.chunk_size,
            send_crc32c: self.writer.send_crc32c,
            ..WriterOptions::default()
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

fn emulator_endpoint(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn non_empty_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
        Ok(value) => Ok(Some(value)),
        Err(_) => Ok(None),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_env(key, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn access_token_redacted_debug() {
        let token = AccessToken::new("ya29.secret".to_string());
        let debug = format!("{token:?}");
        assert!(!debug.contains("ya29.secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test_case("localhost:9000", "http://localhost:9000" ; "bare host")]
    #[test_case("http://127.0.0.1:4443", "http://127.0.0.1:4443" ; "with scheme")]
    fn emulator_endpoint_scheme(host: &str, expected: &str) {
        assert_eq!(emulator_endpoint(host), expected);
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert!(!config.emulator);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.writer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.writer.send_crc32c);
    }

    #[test]
    fn call_settings_carry_retry_and_project() {
        let config = ClientConfig {
            user_project: Some("billing".to_string()),
            retry: RetrySettings {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_secs(1),
                multiplier: 3.0,
                max_attempts: 4,
            },
            ..ClientConfig::default()
        };

        let settings = config.call_settings();
        assert_eq!(settings.user_project.as_deref(), Some("billing"));
        assert_eq!(settings.backoff.initial_delay, Duration::from_millis(5));
        assert_eq!(settings.backoff.max_delay, Duration::from_secs(1));
        assert!((settings.backoff.multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(settings.backoff.max_attempts, 4);
    }

    #[test]
    fn writer_options_seeded_from_settings() {
        let config = ClientConfig {
            writer: WriterSettings {
                chunk_size: 0,
                send_crc32c: false,
            },
            ..ClientConfig::default()
        };

        let options = config.writer_options();
        assert_eq!(options.chunk_size, 0);
        assert!(!options.send_crc32c);
    }
}
