//! Configuration loading for the Logly agent.

mod settings;

pub use settings::{
    AggregationConfig, CollectionConfig, CorrelationConfig, DatabaseConfig, LogSourceConfig,
    LoglyConfig, LoglyConfigOverlay, LogsConfig, NetworkConfig, RetentionConfig, SystemConfig,
};
