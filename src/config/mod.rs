//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ClientConfig (validated, immutable)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → sync_instances pushes the instance list into the registry
//!     → resolver emits a new address set
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Only the instance list is hot-reloaded; policy changes need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BalancerConfig, ClientConfig, DiscoveryConfig, InstanceConfig, LogFormat, ObservabilityConfig,
    TransportConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::{sync_instances, ConfigWatcher};
