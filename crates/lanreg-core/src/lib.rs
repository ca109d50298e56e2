//! # lanreg core
//!
//! Core types and configuration for the lanreg local-network service
//! registry.
//!
//! - **Types**: [`Service`], [`Node`], [`Endpoint`] and the [`WatchEvent`]s
//!   delivered to watchers.
//! - **Configuration**: [`RegistryConfig`] with a typed builder, and
//!   [`AppConfig`] for loading YAML files with environment overrides.
//! - **Errors**: [`ConfigError`] for configuration failures.
//!
//! ## Example
//!
//! ```
//! use lanreg_core::types::{Node, Service};
//!
//! let service = Service::new("greeter", "1.0.0")
//!     .with_node(Node::new("greeter-1", "10.0.0.1:8080").with_metadata("zone", "a"));
//!
//! assert!(service.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, LogFormat, LoggingConfig, RegistryConfig, RegistryConfigBuilder};
pub use error::{ConfigError, Result};
pub use types::{Action, Endpoint, Node, Service, Value, WatchEvent};
