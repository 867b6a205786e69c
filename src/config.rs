//! Configuration types, defaults and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecConfig;
use crate::compression::CompressionConfig;
use crate::error::CacheError;

/// Default cache data expiration when the config leaves it at zero.
pub const DEFAULT_IN_MEMORY_EXPIRATION: Duration = Duration::from_secs(86_400);

const DEFAULT_CAPACITY: u64 = 1_000_000;
const DEFAULT_DLOCK_RETRY_INTERVAL_MILLIS: u64 = 100;
const DEFAULT_DLOCK_UNIT_EXPIRATION_MILLIS: u64 = 5_000;

/// Cache kind selected by [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    InMemory,
    Redis,
    MultiLayer,
}

/// Top-level cache configuration. Based on `kind`, the matching typed field
/// is used; only `InMemory` is wired in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub kind: CacheKind,
    #[serde(default)]
    pub in_memory: InMemoryConfig,
}

impl Config {
    pub fn in_memory(config: InMemoryConfig) -> Self {
        Config {
            kind: CacheKind::InMemory,
            in_memory: config,
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        match self.kind {
            CacheKind::InMemory => self.in_memory.validate(),
            CacheKind::Redis | CacheKind::MultiLayer => {
                Err(CacheError::ConfigTypeNotSupported)
            }
        }
    }
}

/// Config used to construct an in-memory cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InMemoryConfig {
    /// Default cache data expiration in seconds. Zero selects the built-in
    /// default of one day.
    pub default_expiration_secs: u64,

    /// Hard cap on any key's expiration, in seconds. Zero means no cap. It
    /// has higher priority than `default_expiration_secs` but lower than
    /// `Expiration::Never`.
    pub max_expiration_secs: u64,

    /// Disable the cache: reads miss, writes succeed silently.
    pub disabled: bool,

    /// Optional namespace prefix applied to every key.
    pub key_prefix: Option<String>,

    /// Backing store parameters.
    pub store: StoreConfig,

    /// Default codec selection.
    pub codec: CodecConfig,

    /// Byte envelope behavior; only meaningful for encoded-mode stores.
    pub encoding: EncodingConfig,

    /// Behavior of `load`/`load_many` under concurrent demand.
    pub manufacturer: ManufacturerConfig,
}

impl InMemoryConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        self.store.validate()?;
        self.manufacturer.validate(CacheKind::InMemory)?;
        Ok(())
    }

    pub(crate) fn default_expiration(&self) -> Duration {
        if self.default_expiration_secs == 0 {
            DEFAULT_IN_MEMORY_EXPIRATION
        } else {
            Duration::from_secs(self.default_expiration_secs)
        }
    }

    pub(crate) fn max_expiration(&self) -> Option<Duration> {
        if self.max_expiration_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_expiration_secs))
        }
    }
}

/// Which in-memory engine backs the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// TinyLFU store holding values by reference (no envelope).
    #[default]
    Moka,
    /// Plain map store holding envelope bytes, with sweep-on-set eviction.
    HashMap,
}

/// How a cached entry's cost is computed against the capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostFunction {
    /// Every entry costs 1; capacity is a key count.
    #[default]
    One,
    /// Entries cost their payload size; capacity is a byte budget.
    ByteSize,
}

/// Configuration for eviction sweeps on set operations (HashMap backend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EvictOnSetConfig {
    /// Probability (0 to 1) that a `set` triggers a sweep. `1.0` sweeps on
    /// every set, `0.0` disables sweeping.
    pub frequency: f64,
    /// After dropping expired entries, remove oldest entries until the map
    /// holds at most this many items.
    pub max_items: usize,
}

/// Backing store parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Maximum total cost of cached entries. The unit depends on
    /// `cost_function`: a key count for `One`, bytes for `ByteSize`.
    /// Zero selects the built-in default of 1,000,000.
    pub capacity: u64,

    pub cost_function: CostFunction,

    /// Sweep configuration for the HashMap backend.
    pub evict_on_set: Option<EvictOnSetConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::default(),
            capacity: 0,
            cost_function: CostFunction::default(),
            evict_on_set: None,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if let Some(evict) = &self.evict_on_set {
            if !(0.0..=1.0).contains(&evict.frequency) {
                return Err(CacheError::InvalidConfig(format!(
                    "evict_on_set frequency out of range: {}",
                    evict.frequency
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn effective_capacity(&self) -> u64 {
        if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        }
    }
}

/// Config to control the built-in bytes protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EncodingConfig {
    /// When true, raw payload bytes go to the store with no envelope and no
    /// compression.
    pub disable_encoding: bool,
    pub compression: CompressionConfig,
}

/// Strategy to mitigate cache stampede on `load`/`load_many`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StampedeMitigationStrategy {
    /// Every requester loads without checking whether others are loading the
    /// same data.
    #[default]
    NoProtection,
    /// One task loads per key; the result is broadcast to waiting tasks in
    /// the same process.
    InProcessSignal,
    /// One instance loads per key, coordinated through a distributed lock.
    /// Not supported for in-memory caches.
    AcrossInstanceSignal,
}

/// Extra config for [`StampedeMitigationStrategy::AcrossInstanceSignal`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AcrossInstanceConfig {
    /// Interval for retrying to read a value that another instance is
    /// loading. Zero selects 100 ms.
    pub retry_interval_millis: u64,
    /// Unit expiration of the distributed lock; the lock is extended while
    /// loading. Zero selects 5000 ms.
    pub dlock_unit_expiration_millis: u64,
}

impl AcrossInstanceConfig {
    pub fn retry_interval(&self) -> Duration {
        let millis = if self.retry_interval_millis == 0 {
            DEFAULT_DLOCK_RETRY_INTERVAL_MILLIS
        } else {
            self.retry_interval_millis
        };
        Duration::from_millis(millis)
    }

    pub fn dlock_unit_expiration(&self) -> Duration {
        let millis = if self.dlock_unit_expiration_millis == 0 {
            DEFAULT_DLOCK_UNIT_EXPIRATION_MILLIS
        } else {
            self.dlock_unit_expiration_millis
        };
        Duration::from_millis(millis)
    }
}

/// How data is produced when multiple tasks demand the same keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ManufacturerConfig {
    pub stampede_mitigation: StampedeMitigationStrategy,
    pub across_instance: AcrossInstanceConfig,
}

impl ManufacturerConfig {
    pub fn validate(&self, kind: CacheKind) -> Result<(), CacheError> {
        match self.stampede_mitigation {
            StampedeMitigationStrategy::AcrossInstanceSignal => {
                if kind == CacheKind::InMemory {
                    return Err(CacheError::InvalidConfig(
                        "across_instance_signal does not support in-memory caches".into(),
                    ));
                }
                Ok(())
            }
            _ => {
                if self.across_instance.retry_interval_millis != 0
                    || self.across_instance.dlock_unit_expiration_millis != 0
                {
                    return Err(CacheError::InvalidConfig(format!(
                        "across_instance config is invalid for strategy {:?}",
                        self.stampede_mitigation
                    )));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::in_memory(InMemoryConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unwired_kinds_rejected() {
        let config = Config {
            kind: CacheKind::Redis,
            in_memory: InMemoryConfig::default(),
        };
        assert_eq!(
            config.validate().unwrap_err(),
            CacheError::ConfigTypeNotSupported
        );
    }

    #[test]
    fn test_across_instance_rejected_for_in_memory() {
        let config = Config::in_memory(InMemoryConfig {
            manufacturer: ManufacturerConfig {
                stampede_mitigation: StampedeMitigationStrategy::AcrossInstanceSignal,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(matches!(
            config.validate().unwrap_err(),
            CacheError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_across_instance_fields_rejected_for_other_strategies() {
        let config = Config::in_memory(InMemoryConfig {
            manufacturer: ManufacturerConfig {
                stampede_mitigation: StampedeMitigationStrategy::InProcessSignal,
                across_instance: AcrossInstanceConfig {
                    retry_interval_millis: 50,
                    ..Default::default()
                },
            },
            ..Default::default()
        });
        assert!(matches!(
            config.validate().unwrap_err(),
            CacheError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_expiration_defaults() {
        let config = InMemoryConfig::default();
        assert_eq!(config.default_expiration(), DEFAULT_IN_MEMORY_EXPIRATION);
        assert_eq!(config.max_expiration(), None);

        let config = InMemoryConfig {
            default_expiration_secs: 60,
            max_expiration_secs: 3600,
            ..Default::default()
        };
        assert_eq!(config.default_expiration(), Duration::from_secs(60));
        assert_eq!(config.max_expiration(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_evict_frequency_out_of_range() {
        let store = StoreConfig {
            backend: StoreBackend::HashMap,
            evict_on_set: Some(EvictOnSetConfig {
                frequency: 1.5,
                max_items: 10,
            }),
            ..Default::default()
        };
        assert!(store.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_from_json() {
        let json = r#"{
            "kind": "in_memory",
            "in_memory": {
                "default_expiration_secs": 300,
                "store": { "backend": "hash_map", "capacity": 1000 },
                "encoding": { "compression": { "algo": "gzip" } },
                "manufacturer": { "stampede_mitigation": "in_process_signal" }
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, CacheKind::InMemory);
        assert_eq!(config.in_memory.default_expiration_secs, 300);
        assert_eq!(config.in_memory.store.backend, StoreBackend::HashMap);
        assert_eq!(
            config.in_memory.manufacturer.stampede_mitigation,
            StampedeMitigationStrategy::InProcessSignal
        );
        assert!(config.validate().is_ok());
    }
}
