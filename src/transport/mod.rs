//! Transport boundary.
//!
//! # Data Flow
//! ```text
//! Balancer needs a connection for an Address
//!     → Connector::new_sub_conn (create handle, non-blocking)
//!     → SubConn::connect (dial in the background)
//!     → StateListener::report (Connecting / Ready / TransientFailure / ...)
//!     → BalancerEvent::SubConnState delivered to the balancer event loop
//!
//! Address removed or balancer closed:
//!     → SubConn::shutdown
//!     → final Shutdown notification (stale by then, ignored)
//! ```
//!
//! # Design Decisions
//! - Connectivity state is reported by the transport, never computed here
//! - Handles are identified by `SubConnId` so notifications can be routed
//!   without comparing trait objects
//! - `connect` and `shutdown` never block the caller

pub mod tcp;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::balancer::BalancerEvent;
use crate::resolver::Address;

/// Connectivity state of a single sub-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Idle => "idle",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Ready => "ready",
            ConnectivityState::TransientFailure => "transient_failure",
            ConnectivityState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a sub-connection, unique within one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubConnId(pub u64);

impl fmt::Display for SubConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subconn-{}", self.0)
    }
}

/// One outbound connection owned by a balancer.
pub trait SubConn: Send + Sync + fmt::Debug {
    /// The address this connection dials.
    fn address(&self) -> &Address;

    /// Start connecting in the background. A no-op once shut down.
    fn connect(&self);

    /// Tear the connection down. The transport eventually reports
    /// `ConnectivityState::Shutdown` for it.
    fn shutdown(&self);
}

/// Shared handle to a sub-connection.
pub type SubConnRef = Arc<dyn SubConn>;

/// Errors raised while creating a sub-connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The address could not be understood by this transport.
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The transport refused to create the connection.
    #[error("sub-connection rejected: {0}")]
    Rejected(String),
}

/// Factory for sub-connections.
///
/// Implementations must return without blocking: the balancer calls this
/// while holding its mutation lock.
pub trait Connector: Send + Sync {
    fn new_sub_conn(
        &self,
        addr: &Address,
        listener: StateListener,
    ) -> Result<SubConnRef, TransportError>;
}

/// Reporting side of a sub-connection's state notifications.
#[derive(Debug, Clone)]
pub struct StateListener {
    id: SubConnId,
    events: mpsc::UnboundedSender<BalancerEvent>,
}

impl StateListener {
    pub fn new(id: SubConnId, events: mpsc::UnboundedSender<BalancerEvent>) -> Self {
        Self { id, events }
    }

    /// The sub-connection this listener reports for.
    pub fn id(&self) -> SubConnId {
        self.id
    }

    /// Deliver a state change. Dropped silently once the balancer is gone.
    pub fn report(&self, state: ConnectivityState) {
        let _ = self.events.send(BalancerEvent::SubConnState { id: self.id, state });
    }
}
