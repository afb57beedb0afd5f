//! Per-call routing intent.
//!
//! A caller attaches at most one hint to a call: pin it to a node, or keep
//! it away from one. Empty node ids are ignored. When both hints are set the
//! preferred node wins, because the picker checks it first.

use crate::balancer::NodeId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingIntent {
    preferred: Option<NodeId>,
    excluded: Option<NodeId>,
}

impl RoutingIntent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the call to `node_id` only.
    pub fn with_preferred_node(mut self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        if !node_id.is_empty() {
            self.preferred = Some(NodeId::from(node_id));
        }
        self
    }

    /// Avoid `node_id` when another node is available.
    pub fn with_excluded_node(mut self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        if !node_id.is_empty() {
            self.excluded = Some(NodeId::from(node_id));
        }
        self
    }

    pub fn preferred_node(&self) -> Option<&NodeId> {
        self.preferred.as_ref()
    }

    pub fn excluded_node(&self) -> Option<&NodeId> {
        self.excluded.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.preferred.is_none() && self.excluded.is_none()
    }
}
