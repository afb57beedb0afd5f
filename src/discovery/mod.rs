//! Service registry contract.
//!
//! # Responsibilities
//! - Describe service instances as registered by servers
//! - List the instances of a service
//! - Stream Add/Delete events for a service
//!
//! # Design Decisions
//! - Registries are shared as `Arc<dyn Registry>` across channels
//! - Subscriptions use broadcast channels; a lagged subscriber re-lists
//! - No registry implementation here talks to an external system

pub mod memory;
pub mod noop;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryRegistry;
pub use noop::NoopRegistry;

/// A registered instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance id as registered.
    pub id: String,
    /// Service name as registered.
    pub name: String,
    /// Instance endpoint (`host:port`).
    pub addr: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub init_capacity: i64,
    #[serde(default)]
    pub max_capacity: i64,
    #[serde(default)]
    pub increase_step: i64,
    #[serde(default)]
    pub growth_rate: f64,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            addr: addr.into(),
            version: String::new(),
            metadata: HashMap::new(),
            init_capacity: 0,
            max_capacity: 0,
            increase_step: 0,
            growth_rate: 0.0,
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Unknown,
    Add,
    Delete,
}

impl EventType {
    pub fn is_add(&self) -> bool {
        *self == EventType::Add
    }

    pub fn is_delete(&self) -> bool {
        *self == EventType::Delete
    }
}

/// A change to a service's instance set.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    pub instance: ServiceInstance,
}

/// Errors returned by registries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("registry request timed out after {0} ms")]
    Timeout(u64),

    #[error("registry is closed")]
    Closed,

    #[error("registry error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, instance: ServiceInstance) -> Result<(), DiscoveryError>;

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError>;

    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// Subscribe to changes of service `name`.
    fn subscribe(&self, name: &str) -> broadcast::Receiver<Event>;

    async fn close(&self) -> Result<(), DiscoveryError>;
}
