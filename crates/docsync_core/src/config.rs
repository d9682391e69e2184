//! Local store configuration.

use std::time::Duration;

/// Rough performance class of the host device.
///
/// Slower devices pay relatively more for a full collection scan, so the
/// index auto-creation heuristic kicks in earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    /// Desktop or recent mobile hardware.
    #[default]
    Fast,
    /// Average mobile hardware.
    Standard,
    /// Low-end hardware.
    LowEnd,
}

impl DeviceClass {
    /// Cost of reading one document through an index, relative to reading
    /// one document during a full scan.
    pub fn relative_index_read_cost(self) -> f64 {
        match self {
            DeviceClass::Fast => 8.0,
            DeviceClass::Standard => 6.0,
            DeviceClass::LowEnd => 4.0,
        }
    }
}

/// Configuration for the query engine's index heuristic.
#[derive(Debug, Clone)]
pub struct QueryEngineConfig {
    /// Whether the engine may create field indexes on its own.
    pub index_auto_creation_enabled: bool,

    /// Minimum number of documents a full scan must read before an index is
    /// considered.
    pub min_collection_size: usize,

    /// Device class used to derive the read cost ratio.
    pub device_class: DeviceClass,

    /// Overrides the ratio derived from `device_class`.
    pub relative_index_read_cost: Option<f64>,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: false,
            min_collection_size: 100,
            device_class: DeviceClass::Fast,
            relative_index_read_cost: None,
        }
    }
}

impl QueryEngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables index auto-creation.
    #[must_use]
    pub const fn with_index_auto_creation(mut self, enabled: bool) -> Self {
        self.index_auto_creation_enabled = enabled;
        self
    }

    /// Sets the minimum collection size.
    #[must_use]
    pub const fn with_min_collection_size(mut self, size: usize) -> Self {
        self.min_collection_size = size;
        self
    }

    /// Sets the device class.
    #[must_use]
    pub const fn with_device_class(mut self, class: DeviceClass) -> Self {
        self.device_class = class;
        self
    }

    /// Overrides the relative index read cost.
    #[must_use]
    pub fn with_relative_index_read_cost(mut self, cost: f64) -> Self {
        self.relative_index_read_cost = Some(cost);
        self
    }

    /// Returns the effective read cost ratio.
    pub fn relative_index_read_cost(&self) -> f64 {
        self.relative_index_read_cost
            .unwrap_or_else(|| self.device_class.relative_index_read_cost())
    }
}

/// Configuration for the local store.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Query engine settings.
    pub query_engine: QueryEngineConfig,

    /// A target's resume token is persisted when it carries no document
    /// changes only if at least this much snapshot time has passed since the
    /// last persisted token.
    pub resume_token_max_age: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            query_engine: QueryEngineConfig::default(),
            resume_token_max_age: Duration::from_millis(300),
        }
    }
}

impl LocalStoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the query engine configuration.
    #[must_use]
    pub fn with_query_engine(mut self, config: QueryEngineConfig) -> Self {
        self.query_engine = config;
        self
    }

    /// Sets the resume token max age.
    #[must_use]
    pub const fn with_resume_token_max_age(mut self, age: Duration) -> Self {
        self.resume_token_max_age = age;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = QueryEngineConfig::default();
        assert!(!config.index_auto_creation_enabled);
        assert_eq!(config.min_collection_size, 100);
        assert_eq!(config.relative_index_read_cost(), 8.0);
    }

    #[test]
    fn device_class_scales_cost() {
        let config = QueryEngineConfig::new().with_device_class(DeviceClass::LowEnd);
        assert_eq!(config.relative_index_read_cost(), 4.0);

        let config = config.with_relative_index_read_cost(2.5);
        assert_eq!(config.relative_index_read_cost(), 2.5);
    }

    #[test]
    fn local_store_defaults() {
        let config = LocalStoreConfig::default();
        assert_eq!(config.resume_token_max_age, Duration::from_millis(300));
    }
}
