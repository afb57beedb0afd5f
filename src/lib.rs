//! Client-side connection selection with node-aware routing.

pub mod balancer;
pub mod client;
pub mod config;
pub mod discovery;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod resolver;
pub mod transport;

pub use balancer::{NodeId, PickError, PickInfo, RoutingIntent, ROUTING_ROUND_ROBIN};
pub use client::{Channel, ChannelOptions, ClientPool};
pub use config::schema::ClientConfig;
pub use lifecycle::Shutdown;
