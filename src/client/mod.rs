//! Balanced client channels and the per-service client pool.
//!
//! # Data Flow
//! ```text
//! ClientPool::get(service)
//!     → cached client, or Channel::connect (load-or-store)
//!
//! Channel::connect
//!     → BalancerRegistry (policy name → builder)
//!     → ChannelCore (ClientConn: ids, listeners, picker store)
//!     → event loop task (BalancerEvent → Balancer::handle_event)
//!     → DiscoveryResolver task (Registry → ResolverSink)
//!
//! Channel::pick
//!     → current BalancerState (ArcSwap load, no lock)
//!     → Picker::pick
//! ```
//!
//! # Design Decisions
//! - Every balancer input goes through one ordered event queue
//! - Dropping the last clone of a channel closes it

pub mod channel;
pub mod pool;

use thiserror::Error;

pub use channel::{Channel, ChannelOptions};
pub use pool::ClientPool;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("balancer policy '{0}' is not registered")]
    UnknownPolicy(String),

    #[error("channels must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("channel to '{target}' not ready after {timeout_ms}ms")]
    NotReady { target: String, timeout_ms: u64 },

    #[error("channel to '{0}' is closed")]
    Closed(String),
}
