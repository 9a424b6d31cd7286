//! DHT settings module
//!
//! Every tunable of the node in one serde-friendly struct. Durations are
//! stored as milliseconds so the JSON settings file stays flat.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};

/// Tunables for a DHT node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// Bucket size and replication parameter
    pub k: usize,
    /// Parallel requests during a node lookup
    pub alpha: usize,
    /// Parallel requests during a value lookup
    pub value_alpha: usize,
    /// Per-request response deadline
    pub request_timeout_ms: u64,
    /// How often expired pending requests are swept
    pub request_sweep_interval_ms: u64,
    /// Upper bound on outstanding requests
    pub max_pending_requests: usize,
    /// Upper bound on concurrently running lookups
    pub max_concurrent_lookups: usize,
    /// Overall deadline of one lookup
    pub lookup_timeout_ms: u64,
    /// Failed requests after which a contact is evicted
    pub max_contact_failures: u32,
    /// Failures in a row after which the node assumes it is offline
    pub max_consecutive_failures: u32,
    /// Replacement cache entries per bucket
    pub replacement_cache_size: usize,
    /// Buckets untouched this long get refreshed
    pub bucket_refresh_interval_ms: u64,
    /// How often buckets are checked for staleness
    pub bucket_refresh_check_ms: u64,
    /// Lifetime of a remote value
    pub value_ttl_ms: u64,
    /// How often local values are stored again
    pub republish_interval_ms: u64,
    /// How often expired values are purged
    pub database_cleaner_period_ms: u64,
    /// Values kept per key
    pub max_values_per_key: usize,
    /// Distinct keys kept in the database
    pub max_keys: usize,
    /// Largest accepted value payload in bytes
    pub max_value_size: usize,
    /// How often the token secret rotates
    pub token_rotation_interval_ms: u64,
    /// Fill ratio at which bootstrapping stops
    pub bootstrap_fill_ratio: f64,
    /// Self-lookups attempted while bootstrapping
    pub bootstrap_max_attempts: usize,
    /// Weight of the newest sample in the request load average
    pub request_load_smoothing: f32,
    /// Gaps longer than this reset the request load
    pub request_load_nulling_delay_ms: u64,
    /// Keep querying after values are found
    pub exhaustive_value_lookup: bool,
    /// Largest datagram sent or accepted
    pub max_message_size: usize,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            value_alpha: 5,
            request_timeout_ms: 3_000,
            request_sweep_interval_ms: 100,
            max_pending_requests: 1024,
            max_concurrent_lookups: 64,
            lookup_timeout_ms: 30_000,
            max_contact_failures: 4,
            max_consecutive_failures: 100,
            replacement_cache_size: 16,
            bucket_refresh_interval_ms: 30 * 60 * 1000,
            bucket_refresh_check_ms: 60_000,
            value_ttl_ms: 60 * 60 * 1000,
            republish_interval_ms: 30 * 60 * 1000,
            database_cleaner_period_ms: 5 * 60 * 1000,
            max_values_per_key: 5,
            max_keys: 16_384,
            max_value_size: 4096,
            token_rotation_interval_ms: 5 * 60 * 1000,
            bootstrap_fill_ratio: 0.5,
            bootstrap_max_attempts: 3,
            request_load_smoothing: 0.25,
            request_load_nulling_delay_ms: 30_000,
            exhaustive_value_lookup: false,
            max_message_size: 8192,
        }
    }
}

impl DhtSettings {
    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            DhtError::config_error_with_field(
                format!("Failed to read settings file: {}", e),
                path.display().to_string(),
            )
        })?;
        let settings: DhtSettings = serde_json::from_str(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "k"));
        }
        if self.alpha == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "alpha"));
        }
        if self.value_alpha == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "value_alpha"));
        }
        if self.request_timeout_ms == 0 {
            return Err(DhtError::config_error_with_field("must be positive", "request_timeout_ms"));
        }
        if self.request_sweep_interval_ms == 0 {
            return Err(DhtError::config_error_with_field(
                "must be positive",
                "request_sweep_interval_ms",
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "max_pending_requests"));
        }
        if self.max_concurrent_lookups == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "max_concurrent_lookups"));
        }
        if self.lookup_timeout_ms < self.request_timeout_ms {
            return Err(DhtError::config_error_with_field(
                "must not be shorter than request_timeout_ms",
                "lookup_timeout_ms",
            ));
        }
        if self.max_contact_failures == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "max_contact_failures"));
        }
        if self.max_values_per_key == 0 {
            return Err(DhtError::config_error_with_field("must be at least 1", "max_values_per_key"));
        }
        if !(0.0..=1.0).contains(&self.bootstrap_fill_ratio) {
            return Err(DhtError::config_error_with_field(
                "must be between 0.0 and 1.0",
                "bootstrap_fill_ratio",
            ));
        }
        if !(self.request_load_smoothing > 0.0 && self.request_load_smoothing <= 1.0) {
            return Err(DhtError::config_error_with_field(
                "must be in (0.0, 1.0]",
                "request_load_smoothing",
            ));
        }
        // a store request must fit at least one maximum-size value
        if self.max_message_size < self.max_value_size + 256 {
            return Err(DhtError::config_error_with_field(
                "too small for max_value_size",
                "max_message_size",
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn request_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.request_sweep_interval_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn bucket_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.bucket_refresh_interval_ms)
    }

    pub fn bucket_refresh_check(&self) -> Duration {
        Duration::from_millis(self.bucket_refresh_check_ms)
    }

    pub fn value_ttl(&self) -> Duration {
        Duration::from_millis(self.value_ttl_ms)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_millis(self.republish_interval_ms)
    }

    pub fn database_cleaner_period(&self) -> Duration {
        Duration::from_millis(self.database_cleaner_period_ms)
    }

    pub fn token_rotation_interval(&self) -> Duration {
        Duration::from_millis(self.token_rotation_interval_ms)
    }

    pub fn request_load_nulling_delay(&self) -> Duration {
        Duration::from_millis(self.request_load_nulling_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_valid() {
        let settings = DhtSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.k, 20);
        assert_eq!(settings.alpha, 3);
        assert_eq!(settings.request_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_k() {
        let settings = DhtSettings {
            k: 0,
            ..DhtSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("k"));
    }

    #[test]
    fn test_invalid_fill_ratio() {
        let settings = DhtSettings {
            bootstrap_fill_ratio: 1.5,
            ..DhtSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_message_size_must_fit_value() {
        let settings = DhtSettings {
            max_message_size: 1024,
            max_value_size: 4096,
            ..DhtSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings: DhtSettings = serde_json::from_str(r#"{"k": 8, "alpha": 2}"#).unwrap();
        assert_eq!(settings.k, 8);
        assert_eq!(settings.alpha, 2);
        assert_eq!(settings.value_alpha, 5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("overlay-dht-settings-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"request_timeout_ms": 500, "lookup_timeout_ms": 5000}"#).unwrap();
        let settings = DhtSettings::from_json_file(&path).unwrap();
        assert_eq!(settings.request_timeout(), Duration::from_millis(500));
        std::fs::remove_file(&path).ok();

        assert!(DhtSettings::from_json_file("/nonexistent/settings.json").is_err());
    }
}
