// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime configuration.

use std::time::Duration;

/// Default messaging endpoint.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
/// Runtime name, also the key/value bucket name prefix.
pub const DEFAULT_RUNTIME_NAME: &str = "foliage_runtime";
/// Default key/value bucket name.
pub const DEFAULT_KEY_VALUE_STORE_BUCKET: &str = "foliage_runtime_kv_store";
/// Seconds after which a held KV mutex is considered stale.
pub const DEFAULT_KV_MUTEX_LIFETIME_SEC: u64 = 120;
/// Polling cadence for blocking mutex acquisition.
pub const DEFAULT_KV_MUTEX_IS_OLD_POLLING_INTERVAL_SEC: u64 = 10;
/// Idle lifetime of a per-id handler.
pub const DEFAULT_FUNCTION_TYPE_ID_LIFETIME_MS: u64 = 5000;
/// Synchronous request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SEC: u64 = 60;
/// Name of the hub domain.
pub const DEFAULT_HUB_DOMAIN_NAME: &str = "hub";

/// Runtime configuration with chainable setters.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Messaging endpoint handed to substrate bindings that dial out.
    pub nats_url: String,
    /// Key/value bucket name (the physical bucket is `KV_<name>`).
    pub key_value_store_bucket_name: String,
    /// Staleness horizon of KV mutexes, in seconds.
    pub kv_mutex_life_time_sec: u64,
    /// Poll interval while waiting on a held mutex, in seconds.
    pub kv_mutex_is_old_polling_interval_sec: u64,
    /// Default idle lifetime of per-id handlers, in milliseconds.
    pub function_type_id_lifetime_ms: u64,
    /// Synchronous request timeout, in seconds.
    pub request_timeout_sec: u64,
    /// Name of the hub domain.
    pub hub_domain_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nats_url: DEFAULT_NATS_URL.to_string(),
            key_value_store_bucket_name: DEFAULT_KEY_VALUE_STORE_BUCKET.to_string(),
            kv_mutex_life_time_sec: DEFAULT_KV_MUTEX_LIFETIME_SEC,
            kv_mutex_is_old_polling_interval_sec: DEFAULT_KV_MUTEX_IS_OLD_POLLING_INTERVAL_SEC,
            function_type_id_lifetime_ms: DEFAULT_FUNCTION_TYPE_ID_LIFETIME_MS,
            request_timeout_sec: DEFAULT_REQUEST_TIMEOUT_SEC,
            hub_domain_name: DEFAULT_HUB_DOMAIN_NAME.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `FOLIAGE_*` environment variables, falling
    /// back to the defaults for anything unset.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `FOLIAGE_NATS_URL` | `nats://localhost:4222` |
    /// | `FOLIAGE_KV_BUCKET` | `foliage_runtime_kv_store` |
    /// | `FOLIAGE_KV_MUTEX_LIFETIME_SEC` | `120` |
    /// | `FOLIAGE_KV_MUTEX_POLLING_INTERVAL_SEC` | `10` |
    /// | `FOLIAGE_ID_LIFETIME_MS` | `5000` |
    /// | `FOLIAGE_REQUEST_TIMEOUT_SEC` | `60` |
    /// | `FOLIAGE_HUB_DOMAIN` | `hub` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("FOLIAGE_NATS_URL") {
            config.nats_url = url;
        }
        if let Ok(bucket) = std::env::var("FOLIAGE_KV_BUCKET") {
            config.key_value_store_bucket_name = bucket;
        }
        config.kv_mutex_life_time_sec =
            parse_env("FOLIAGE_KV_MUTEX_LIFETIME_SEC", config.kv_mutex_life_time_sec)?;
        config.kv_mutex_is_old_polling_interval_sec = parse_env(
            "FOLIAGE_KV_MUTEX_POLLING_INTERVAL_SEC",
            config.kv_mutex_is_old_polling_interval_sec,
        )?;
        config.function_type_id_lifetime_ms =
            parse_env("FOLIAGE_ID_LIFETIME_MS", config.function_type_id_lifetime_ms)?;
        config.request_timeout_sec =
            parse_env("FOLIAGE_REQUEST_TIMEOUT_SEC", config.request_timeout_sec)?;
        if let Ok(hub) = std::env::var("FOLIAGE_HUB_DOMAIN") {
            config.hub_domain_name = hub;
        }
        Ok(config)
    }

    /// Set the messaging endpoint.
    pub fn with_nats_url(mut self, nats_url: impl Into<String>) -> Self {
        self.nats_url = nats_url.into();
        self
    }

    /// Set the key/value bucket name.
    pub fn with_key_value_store_bucket_name(mut self, name: impl Into<String>) -> Self {
        self.key_value_store_bucket_name = name.into();
        self
    }

    /// Set the mutex staleness horizon.
    pub fn with_kv_mutex_life_time_sec(mut self, secs: u64) -> Self {
        self.kv_mutex_life_time_sec = secs;
        self
    }

    /// Set the mutex poll interval.
    pub fn with_kv_mutex_is_old_polling_interval_sec(mut self, secs: u64) -> Self {
        self.kv_mutex_is_old_polling_interval_sec = secs;
        self
    }

    /// Set the default per-id handler idle lifetime.
    pub fn with_function_type_id_lifetime_ms(mut self, millis: u64) -> Self {
        self.function_type_id_lifetime_ms = millis;
        self
    }

    /// Set the synchronous request timeout.
    pub fn with_request_timeout_sec(mut self, secs: u64) -> Self {
        self.request_timeout_sec = secs;
        self
    }

    /// Set the hub domain name.
    pub fn with_hub_domain_name(mut self, name: impl Into<String>) -> Self {
        self.hub_domain_name = name.into();
        self
    }

    /// Mutex staleness horizon as a [`Duration`].
    pub fn kv_mutex_life_time(&self) -> Duration {
        Duration::from_secs(self.kv_mutex_life_time_sec)
    }

    /// Mutex poll interval as a [`Duration`].
    pub fn kv_mutex_polling_interval(&self) -> Duration {
        Duration::from_secs(self.kv_mutex_is_old_polling_interval_sec)
    }

    /// Default per-id idle lifetime as a [`Duration`].
    pub fn function_type_id_lifetime(&self) -> Duration {
        Duration::from_millis(self.function_type_id_lifetime_ms)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

fn parse_env(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds an unparsable value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let config = RuntimeConfig::new();
        assert_eq!(config.key_value_store_bucket_name, "foliage_runtime_kv_store");
        assert_eq!(config.kv_mutex_life_time_sec, 120);
        assert_eq!(config.kv_mutex_is_old_polling_interval_sec, 10);
        assert_eq!(config.function_type_id_lifetime_ms, 5000);
        assert_eq!(config.request_timeout_sec, 60);
        assert_eq!(config.hub_domain_name, "hub");
    }

    #[test]
    fn setters_chain() {
        let config = RuntimeConfig::new()
            .with_nats_url("nats://example:4222")
            .with_key_value_store_bucket_name("test_store")
            .with_kv_mutex_life_time_sec(2)
            .with_function_type_id_lifetime_ms(100)
            .with_request_timeout_sec(5)
            .with_hub_domain_name("central");
        assert_eq!(config.nats_url, "nats://example:4222");
        assert_eq!(config.key_value_store_bucket_name, "test_store");
        assert_eq!(config.kv_mutex_life_time(), Duration::from_secs(2));
        assert_eq!(config.function_type_id_lifetime(), Duration::from_millis(100));
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.hub_domain_name, "central");
    }
}
