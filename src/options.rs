use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::CacheMetrics;
use crate::props::DEFAULT_DUPLICATE_COOLDOWN;

/// Default number of relationship records read per chain page.
pub const DEFAULT_GRAB_SIZE: usize = 100;
/// Default degree above which the store keeps per-(type, direction) chains.
pub const DEFAULT_DENSE_THRESHOLD: usize = 50;

/// Retention discipline of an entity cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Nothing is retained; every access loads from the store.
    None,
    /// Entries live while some reader still holds them.
    Weak,
    /// Entries are retained within a byte budget, least recently used evicted first.
    Soft,
    /// Every entry is retained until cleared.
    Strong,
    /// Generational (young/old) replacement within a byte budget.
    Gcr,
}

impl CacheType {
    /// Configuration name.
    pub fn as_str(self) -> &'static str {
        match self {
            CacheType::None => "none",
            CacheType::Weak => "weak",
            CacheType::Soft => "soft",
            CacheType::Strong => "strong",
            CacheType::Gcr => "gcr",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(CacheType::None),
            "weak" => Ok(CacheType::Weak),
            "soft" => Ok(CacheType::Soft),
            "strong" => Ok(CacheType::Strong),
            "gcr" => Ok(CacheType::Gcr),
            _ => Err(ConfigError::InvalidCacheType {
                value: value.to_string(),
            }),
        }
    }
}

/// Configuration supplied when constructing a [`crate::cache::CacheManager`].
#[derive(Clone)]
pub struct CacheOptions {
    /// Node cache discipline.
    pub node_cache: CacheType,
    /// Relationship cache discipline.
    pub relationship_cache: CacheType,
    /// Byte budget of the node cache for `soft` and `gcr`.
    pub node_cache_bytes: usize,
    /// Byte budget of the relationship cache for `soft` and `gcr`.
    pub relationship_cache_bytes: usize,
    /// Relationship records read per chain page.
    pub grab_size: usize,
    /// Degree above which a store keeps per-(type, direction) chains.
    pub dense_threshold: usize,
    /// Quiet period between two duplicate-key reports for the same key.
    pub duplicate_property_cooldown: Duration,
    /// Whether duplicate property keys are reported through `tracing`.
    pub log_duplicate_properties: bool,
    /// Optional metrics collection implementation.
    pub metrics: Option<Arc<dyn CacheMetrics>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("node_cache", &self.node_cache)
            .field("relationship_cache", &self.relationship_cache)
            .field("node_cache_bytes", &self.node_cache_bytes)
            .field("relationship_cache_bytes", &self.relationship_cache_bytes)
            .field("grab_size", &self.grab_size)
            .field("dense_threshold", &self.dense_threshold)
            .field("duplicate_property_cooldown", &self.duplicate_property_cooldown)
            .field("log_duplicate_properties", &self.log_duplicate_properties)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl CacheOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            node_cache: CacheType::Soft,
            relationship_cache: CacheType::Soft,
            node_cache_bytes: 64 << 20,
            relationship_cache_bytes: 32 << 20,
            grab_size: DEFAULT_GRAB_SIZE,
            dense_threshold: DEFAULT_DENSE_THRESHOLD,
            duplicate_property_cooldown: DEFAULT_DUPLICATE_COOLDOWN,
            log_duplicate_properties: true,
            metrics: None,
        }
    }

    /// Sets the discipline of both entity caches.
    pub fn cache_type(mut self, cache_type: CacheType) -> Self {
        self.node_cache = cache_type;
        self.relationship_cache = cache_type;
        self
    }

    /// Sets the node cache discipline.
    pub fn node_cache(mut self, cache_type: CacheType) -> Self {
        self.node_cache = cache_type;
        self
    }

    /// Sets the relationship cache discipline.
    pub fn relationship_cache(mut self, cache_type: CacheType) -> Self {
        self.relationship_cache = cache_type;
        self
    }

    /// Sets the node cache byte budget.
    pub fn node_cache_bytes(mut self, bytes: usize) -> Self {
        self.node_cache_bytes = bytes;
        self
    }

    /// Sets the relationship cache byte budget.
    pub fn relationship_cache_bytes(mut self, bytes: usize) -> Self {
        self.relationship_cache_bytes = bytes;
        self
    }

    /// Sets the chain page size.
    pub fn grab_size(mut self, records: usize) -> Self {
        self.grab_size = records.max(1);
        self
    }

    /// Sets the dense node threshold.
    pub fn dense_threshold(mut self, degree: usize) -> Self {
        self.dense_threshold = degree;
        self
    }

    /// Sets the duplicate-key report cooldown.
    pub fn duplicate_property_cooldown(mut self, cooldown: Duration) -> Self {
        self.duplicate_property_cooldown = cooldown;
        self
    }

    /// Enables or disables `tracing` reports of duplicate property keys.
    pub fn log_duplicate_properties(mut self, enabled: bool) -> Self {
        self.log_duplicate_properties = enabled;
        self
    }

    /// Installs a metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Failures while reading cache configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read cache config {path}: {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`CacheConfig`].
    #[error("failed to parse cache config: {source}")]
    Parse {
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Unknown cache type name.
    #[error("cache type '{value}' is invalid (expected none, weak, soft, strong or gcr)")]
    InvalidCacheType {
        /// Offending value.
        value: String,
    },
}

/// TOML form of [`CacheOptions`]; every field is optional.
///
/// ```toml
/// node_cache = "gcr"
/// relationship_cache = "weak"
/// node_cache_bytes = 1048576
/// grab_size = 100
/// dense_threshold = 50
/// duplicate_property_cooldown_secs = 7200
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Discipline of both caches, overridden by the per-cache fields.
    pub cache_type: Option<CacheType>,
    /// Node cache discipline.
    pub node_cache: Option<CacheType>,
    /// Relationship cache discipline.
    pub relationship_cache: Option<CacheType>,
    /// Node cache byte budget.
    pub node_cache_bytes: Option<usize>,
    /// Relationship cache byte budget.
    pub relationship_cache_bytes: Option<usize>,
    /// Chain page size.
    pub grab_size: Option<usize>,
    /// Dense node threshold.
    pub dense_threshold: Option<usize>,
    /// Duplicate-key report cooldown in seconds.
    pub duplicate_property_cooldown_secs: Option<u64>,
    /// Whether duplicate keys are logged.
    pub log_duplicate_properties: Option<bool>,
}

impl CacheConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse { source })
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Applies the configured fields on top of `base`.
    pub fn apply(&self, mut base: CacheOptions) -> CacheOptions {
        if let Some(cache_type) = self.cache_type {
            base = base.cache_type(cache_type);
        }
        if let Some(cache_type) = self.node_cache {
            base = base.node_cache(cache_type);
        }
        if let Some(cache_type) = self.relationship_cache {
            base = base.relationship_cache(cache_type);
        }
        if let Some(bytes) = self.node_cache_bytes {
            base = base.node_cache_bytes(bytes);
        }
        if let Some(bytes) = self.relationship_cache_bytes {
            base = base.relationship_cache_bytes(bytes);
        }
        if let Some(records) = self.grab_size {
            base = base.grab_size(records);
        }
        if let Some(degree) = self.dense_threshold {
            base = base.dense_threshold(degree);
        }
        if let Some(secs) = self.duplicate_property_cooldown_secs {
            base = base.duplicate_property_cooldown(Duration::from_secs(secs));
        }
        if let Some(enabled) = self.log_duplicate_properties {
            base = base.log_duplicate_properties(enabled);
        }
        base
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        config.apply(CacheOptions::new())
    }
}
