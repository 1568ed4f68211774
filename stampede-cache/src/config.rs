use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{CacheError, Result};

/// Cache data layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base TTL in milliseconds; 0 disables expiration entirely
    pub cache_ttl_ms: u64,
    /// Namespace prepended to every key this layer manages
    pub key_prefix: String,
    /// Emit per-call debug events
    pub debug: bool,
    /// Jitter band as a fraction of the base TTL (0.1 means +/-10%)
    pub jitter_spread: f64,
    /// Connection settings when the layer builds its own store
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 0,
            key_prefix: "cache".to_string(),
            debug: false,
            jitter_spread: 0.1,
            redis: None,
        }
    }
}

impl CacheConfig {
    /// Create a configuration for the given key namespace
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Self::default()
        }
    }

    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn with_jitter_spread(mut self, spread: f64) -> Self {
        self.jitter_spread = spread;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis = Some(RedisConfig { url: url.into() });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(CacheError::InvalidConfig(
                "key_prefix must not be empty".to_string(),
            ));
        }
        if self.key_prefix.chars().any(char::is_whitespace) {
            return Err(CacheError::InvalidConfig(format!(
                "key_prefix must not contain whitespace: {:?}",
                self.key_prefix
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_spread) {
            return Err(CacheError::InvalidConfig(format!(
                "jitter_spread must be within 0.0..=1.0, got {}",
                self.jitter_spread
            )));
        }
        Ok(())
    }
}
