//! # lanreg registry
//!
//! Local-network service registry over multicast UDP.
//!
//! - [`ServiceStore`]: cache of known instances with TTL expiry.
//! - [`Watcher`]: ordered, bounded per-subscriber change stream.
//! - [`MulticastTransport`]: socket owner; announce, goodbye, query and the
//!   receive path that feeds the store.
//! - [`MulticastRegistry`]: the [`Registry`] implementation composing them.
//! - [`RegistryFactory`]: backend table assembled by the application.
//!
//! ## Example
//!
//! ```no_run
//! use lanreg_core::types::{Node, Service};
//! use lanreg_core::RegistryConfig;
//! use lanreg_registry::{MulticastRegistry, Registry};
//!
//! # async fn run() -> lanreg_registry::Result<()> {
//! let registry = MulticastRegistry::new(RegistryConfig::default())?;
//! registry.start().await?;
//!
//! let service = Service::new("greeter", "1.0.0")
//!     .with_node(Node::new("greeter-1", "10.0.0.1:8080"));
//! registry.register(&service).await?;
//!
//! let watcher = registry.watch().await?;
//! let event = watcher.next().await?;
//! println!("{} {}", event.action, event.service.name);
//!
//! registry.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod factory;
pub mod local;
pub mod reassembly;
pub mod registry;
pub mod store;
pub mod transport;
pub mod watcher;
pub mod wire;

pub use clock::{Clock, ManualClock, TokioClock};
pub use error::{RegistryError, Result};
pub use factory::{RegistryConstructor, RegistryFactory};
pub use local::RegistrationState;
pub use registry::{MulticastRegistry, Registry};
pub use store::{CacheEntry, ServiceStore};
pub use transport::MulticastTransport;
pub use watcher::{WatchOptions, Watcher};
pub use wire::{Announcement, Naming, WireError};
