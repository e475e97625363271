//! Sync core configuration
//!
//! Values are layered: built-in defaults, then an optional YAML/TOML/JSON
//! file, then `CARECIRCLE_SYNC_*` environment variables
//! (e.g. `CARECIRCLE_SYNC_MAX_RETRIES=8`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

pub const ENV_PREFIX: &str = "CARECIRCLE_SYNC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// REST API base URL that replay paths are appended to
    pub api_base_url: String,
    /// WebSocket base URL; the circle id is appended as the last path segment
    pub realtime_url: String,
    /// Bearer token for both the API and the realtime feed
    pub auth_token: Option<String>,
    /// SQLite file holding the queue, cache and sync metadata
    pub database_path: String,
    /// Timeout for every individual API call
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Replay attempts before an action is dropped as exhausted
    pub max_retries: u32,
    #[serde(rename = "retry_base_delay_ms", with = "duration_ms")]
    pub retry_base_delay: Duration,
    #[serde(rename = "retry_max_delay_ms", with = "duration_ms")]
    pub retry_max_delay: Duration,
    #[serde(rename = "reconnect_base_delay_ms", with = "duration_ms")]
    pub reconnect_base_delay: Duration,
    #[serde(rename = "reconnect_max_delay_ms", with = "duration_ms")]
    pub reconnect_max_delay: Duration,
    /// Bridge messages buffered while no listener is attached
    pub bridge_buffer: usize,
    /// Queue an online write whose direct call failed transiently
    pub fallback_to_queue: bool,
    /// Schedule a delayed sync after a pass halts on a transient failure
    pub auto_retry: bool,
    /// Sync automatically when connectivity comes back
    pub sync_on_reconnect: bool,
}

// Serialize Duration as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/v1".to_string(),
            realtime_url: "ws://localhost:8080/ws/circles".to_string(),
            auth_token: None,
            database_path: "carecircle_sync.db".to_string(),
            request_timeout: Duration::from_secs(15),
            max_retries: 5,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            bridge_buffer: 32,
            fallback_to_queue: true,
            auto_retry: true,
            sync_on_reconnect: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&SyncConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: SyncConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;

        tracing::debug!(
            api_base_url = %config.api_base_url,
            database_path = %config.database_path,
            max_retries = config.max_retries,
            "Loaded sync configuration"
        );

        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(SyncError::Config("api_base_url must not be empty".to_string()));
        }
        if self.realtime_url.trim().is_empty() {
            return Err(SyncError::Config("realtime_url must not be empty".to_string()));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(SyncError::Config(
                "retry_base_delay_ms exceeds retry_max_delay_ms".to_string(),
            ));
        }
        if self.reconnect_base_delay.is_zero() || self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(SyncError::Config(
                "reconnect_base_delay_ms must be positive and not exceed reconnect_max_delay_ms"
                    .to_string(),
            ));
        }
        if self.bridge_buffer == 0 {
            return Err(SyncError::Config("bridge_buffer must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "api_base_url: https://api.example.test/v2\nmax_retries: 7\nretry_base_delay_ms: 250\nauth_token: secret"
        )
        .unwrap();

        let config = SyncConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.api_base_url, "https://api.example.test/v2");
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        // untouched keys keep their defaults
        assert_eq!(config.bridge_buffer, 32);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_retries = SyncConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(matches!(zero_retries.validate(), Err(SyncError::Config(_))));

        let inverted = SyncConfig {
            retry_base_delay: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let no_buffer = SyncConfig {
            bridge_buffer: 0,
            ..Default::default()
        };
        assert!(no_buffer.validate().is_err());
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let value = serde_json::to_value(SyncConfig::default()).unwrap();
        assert_eq!(value["request_timeout_ms"], 15_000);
        assert_eq!(value["reconnect_base_delay_ms"], 1_000);
    }
}
