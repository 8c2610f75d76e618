//! Sync worker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use mailsync_api::METADATA_PAGE_SIZE;
use mailsync_common::{Error, Result};

/// Configuration for the shared resume timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after `reset()`.
    pub initial_delay_ms: u64,
    /// Cap for multiplicative growth.
    pub max_delay_ms: u64,
    /// Growth factor applied by `backoff()`.
    pub multiplier: f64,
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 20_000,
            max_delay_ms: 300_000,
            multiplier: 1.4,
        }
    }
}

/// Page sizing and throttling for collection fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagePolicy {
    /// First page size for most collections.
    pub initial_page_size: u64,
    /// First page size for the account's labels or folders.
    pub organization_page_size: u64,
    /// Cap for page growth.
    pub max_page_size: u64,
    /// Growth factor between consecutive pages.
    pub growth_factor: f64,
    /// Minimum spacing between page requests of one collection.
    pub throttle_ms: u64,
}

impl PagePolicy {
    /// Size of the page following one of `limit`.
    pub fn next_page_size(&self, limit: u64) -> u64 {
        let grown = (limit as f64 * self.growth_factor).round() as u64;
        grown.min(self.max_page_size)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
}

impl Default for PagePolicy {
    fn default() -> Self {
        Self {
            initial_page_size: 30,
            organization_page_size: 1000,
            max_page_size: 200,
            growth_factor: 1.5,
            throttle_ms: 1500,
        }
    }
}

/// Configuration for the sync worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub backoff: BackoffConfig,
    pub pages: PagePolicy,
    /// Page size for the metadata prefetch.
    pub metadata_page_size: u64,
    /// Trailing debounce before persisting state.
    pub write_debounce_ms: u64,
}

impl SyncConfig {
    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    /// Check that the configuration can drive a sync.
    ///
    /// # Errors
    /// - Zero page sizes
    /// - Growth or backoff factors below 1
    pub fn validate(&self) -> Result<()> {
        if self.pages.initial_page_size == 0
            || self.pages.organization_page_size == 0
            || self.pages.max_page_size == 0
            || self.metadata_page_size == 0
        {
            return Err(Error::InvalidInput("Page sizes must be positive".to_string()));
        }
        if self.pages.growth_factor < 1.0 || self.backoff.multiplier < 1.0 {
            return Err(Error::InvalidInput(
                "Growth and backoff factors must be at least 1".to_string(),
            ));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(Error::InvalidInput(
                "Initial backoff exceeds maximum".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON; omitted fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            pages: PagePolicy::default(),
            metadata_page_size: METADATA_PAGE_SIZE,
            write_debounce_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_page_size_sequence() {
        let policy = PagePolicy::default();
        let mut limit = policy.initial_page_size;
        let mut sizes = vec![limit];
        for _ in 0..6 {
            limit = policy.next_page_size(limit);
            sizes.push(limit);
        }
        assert_eq!(sizes, vec![30, 45, 68, 102, 153, 200, 200]);
    }

    #[test]
    fn test_organization_page_drops_to_cap() {
        let policy = PagePolicy::default();
        assert_eq!(policy.next_page_size(policy.organization_page_size), 200);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{"pages": {"throttle_ms": 0}}"#).unwrap();
        assert_eq!(config.pages.throttle_ms, 0);
        assert_eq!(config.pages.initial_page_size, 30);
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.write_debounce(), Duration::from_millis(100));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.pages.max_page_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        assert!(SyncConfig::from_json("\"x\"").is_err());
        assert!(SyncConfig::from_json(r#"{"pages": {"max_page_size": 0}}"#).is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = SyncConfig::default();
        let restored = SyncConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    proptest! {
        #[test]
        fn prop_page_size_grows_until_cap(limit in 1u64..10_000) {
            let policy = PagePolicy::default();
            let next = policy.next_page_size(limit);
            prop_assert!(next <= policy.max_page_size);
            if limit < policy.max_page_size {
                prop_assert!(next >= limit);
            }
        }
    }
}
