//! # Service Configuration
//!
//! One configuration shape shared by the coordinator and execution services,
//! loaded from a base TOML file, an optional `environments/<env>.toml`
//! overlay next to it, and `OPPFLOW__SECTION__KEY` environment variables.
//!
//! Every section has defaults, so an empty file is a working configuration:
//!
//! ```rust
//! use service_config::ServiceConfig;
//!
//! let config = ServiceConfig::from_toml_str("[execution]\nqueue_capacity = 32\n").unwrap();
//! assert_eq!(config.execution.queue_capacity, 32);
//! assert_eq!(config.coordinator.dedup_window_ms, 5_000);
//! config.validate().unwrap();
//! ```

pub mod defaults;
pub mod logging;
pub mod service_config;

pub use logging::{LogFormat, LoggingConfig};
pub use service_config::{
    load_config, BreakerSettings, BrokerBackend, BrokerSettings, CoordinatorSettings, DeadLetterSettings,
    ExecutionSettings, InstanceSettings, LeaderSettings, RetrySettings, ServiceConfig,
    SupervisorSettings,
};
