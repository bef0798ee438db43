//! Configuration module - settings structures and loading

pub mod settings;

pub use settings::{
    AuthConfig, InstanceConfig, LoadBalancerConfig, LoggingConfig, RetryConfig, Settings,
};
