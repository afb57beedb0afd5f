//! Resolved addresses and the resolver side of the balancer boundary.
//!
//! # Data Flow
//! ```text
//! Registry (list + subscribe)
//!     → discovery.rs (maintain instance set, map to Address)
//!     → ResolverSink::update (full address set)
//!     → BalancerEvent::ResolverUpdate
//!
//! Registry failure
//!     → ResolverSink::report_error
//!     → BalancerEvent::ResolverError (no connection changes)
//! ```
//!
//! # Design Decisions
//! - Every update carries the full address set, never a delta
//! - Addresses compare by text and attributes, so attribute changes count
//!   as a different endpoint

pub mod discovery;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::balancer::{BalancerEvent, NodeId};

pub use discovery::DiscoveryResolver;

/// Attribute carrying the logical node identifier of an address.
pub const NODE_ID_ATTRIBUTE: &str = "nodeID";

/// One resolved backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Endpoint in `host:port` form.
    pub addr: String,
    /// Attribute bag attached by the resolver.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Attach an attribute, replacing any previous value for `key`.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Logical node of this address: the `nodeID` attribute, or the address
    /// text when the resolver did not provide one.
    pub fn node_id(&self) -> NodeId {
        match self.attribute(NODE_ID_ATTRIBUTE) {
            Some(id) if !id.is_empty() => NodeId::from(id),
            _ => NodeId::from(self.addr.as_str()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Latest full address set for a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

impl ResolverState {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }
}

/// Sending side used by resolvers to feed a balancer.
#[derive(Debug, Clone)]
pub struct ResolverSink {
    events: mpsc::UnboundedSender<BalancerEvent>,
}

impl ResolverSink {
    pub fn new(events: mpsc::UnboundedSender<BalancerEvent>) -> Self {
        Self { events }
    }

    /// Push the full address set. Returns false once the balancer is gone.
    pub fn update(&self, addresses: Vec<Address>) -> bool {
        self.events
            .send(BalancerEvent::ResolverUpdate(ResolverState::new(addresses)))
            .is_ok()
    }

    /// Signal that resolution is currently failing.
    pub fn report_error(&self, message: impl Into<String>) -> bool {
        self.events
            .send(BalancerEvent::ResolverError(message.into()))
            .is_ok()
    }
}
