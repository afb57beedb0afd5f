//! Connection selection subsystem.
//!
//! # Data Flow
//! ```text
//! ResolverState (full address set)
//!     → routing.rs (diff under the lock)
//!     → registry.rs (create / shut down sub-connections, keep maps consistent)
//!
//! Sub-connection state change
//!     → routing.rs (update usable set, ignore stale ids)
//!     → picker.rs (rebuild immutable snapshot)
//!     → ClientConn::update_state (atomic swap of the active picker)
//!
//! Per call:
//!     PickInfo { intent.rs }
//!     → active picker (no lock)
//!     → preferred node / excluded node / round robin
//!     → PickResult or PickError
//! ```
//!
//! # Design Decisions
//! - One mutex guards every map; pickers never take it
//! - Pickers are rebuilt whole, never patched
//! - Balancers are created by name through an explicit `BalancerRegistry`

pub mod builder;
pub mod error;
pub mod intent;
pub mod picker;
pub mod registry;
pub mod routing;

#[cfg(test)]
mod testing;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resolver::{Address, ResolverState};
use crate::transport::{ConnectivityState, SubConnId, SubConnRef, TransportError};

pub use builder::{BalancerBuilder, BalancerRegistry, BuildOptions, RoutingBalancerBuilder};
pub use error::PickError;
pub use intent::RoutingIntent;
pub use picker::{DoneInfo, ErrPicker, PickInfo, PickResult, Picker, RoutingPicker};
pub use routing::RoutingBalancer;

/// Name of the routing round-robin policy.
pub const ROUTING_ROUND_ROBIN: &str = "routing_round_robin";

/// Logical identity of a backend, independent of its network address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to do when an exclusion would leave no candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionFallback {
    /// Ignore the exclusion and round robin over every connection.
    #[default]
    RoundRobin,
    /// Fail the pick with `PickError::AllCandidatesExcluded`.
    Fail,
}

/// Inbound events for a balancer, in delivery order.
#[derive(Debug, Clone)]
pub enum BalancerEvent {
    ResolverUpdate(ResolverState),
    ResolverError(String),
    SubConnState {
        id: SubConnId,
        state: ConnectivityState,
    },
}

/// Aggregate state published by a balancer.
#[derive(Debug, Clone)]
pub struct BalancerState {
    pub connectivity: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl BalancerState {
    /// State before any picker was published.
    pub fn connecting() -> Self {
        Self {
            connectivity: ConnectivityState::Connecting,
            picker: Arc::new(ErrPicker::new(PickError::NoSubConnAvailable)),
        }
    }
}

/// Channel-side services a balancer relies on.
pub trait ClientConn: Send + Sync {
    /// Create (but do not connect) a sub-connection for `addr`.
    fn new_sub_conn(&self, addr: &Address) -> Result<(SubConnId, SubConnRef), TransportError>;

    /// Install a new aggregate state and picker.
    fn update_state(&self, state: BalancerState);
}

/// A load-balancing policy instance owned by one channel.
pub trait Balancer: Send + Sync {
    /// The resolved address set changed.
    fn update_client_conn_state(&self, state: ResolverState);

    /// Resolution is failing; the last known address set stays in effect.
    fn resolver_error(&self, message: &str);

    /// A sub-connection reported a new connectivity state.
    fn update_sub_conn_state(&self, id: SubConnId, state: ConnectivityState);

    /// Shut down every sub-connection and stop accepting events.
    fn close(&self);

    /// Dispatch one inbound event.
    fn handle_event(&self, event: BalancerEvent) {
        match event {
            BalancerEvent::ResolverUpdate(state) => self.update_client_conn_state(state),
            BalancerEvent::ResolverError(message) => self.resolver_error(&message),
            BalancerEvent::SubConnState { id, state } => self.update_sub_conn_state(id, state),
        }
    }
}
