//! Pickers: immutable per-rebuild selection snapshots.
//!
//! # Pick Order
//! ```text
//! no usable connection       → NoSubConnAvailable
//! preferred node set         → that node, or PreferredNodeUnavailable
//! excluded node set          → round robin over the other nodes
//!     every node excluded    → ExclusionFallback (round robin / fail)
//! no intent                  → round robin over all connections
//! ```
//!
//! # Design Decisions
//! - A preferred node is never substituted
//! - Exclusion is best effort under the default fallback
//! - The counter is shared by every caller of one snapshot

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::balancer::{ExclusionFallback, NodeId, PickError, RoutingIntent};
use crate::observability::metrics;
use crate::transport::{SubConnId, SubConnRef};

/// Information about the call being balanced.
#[derive(Debug, Clone, Default)]
pub struct PickInfo {
    /// Fully qualified method name, for logs.
    pub method: String,
    pub intent: RoutingIntent,
}

impl PickInfo {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            intent: RoutingIntent::default(),
        }
    }

    pub fn with_intent(mut self, intent: RoutingIntent) -> Self {
        self.intent = intent;
        self
    }
}

/// Outcome of a finished call, passed to `PickResult::done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneInfo {
    pub success: bool,
}

/// Callback run once the call on the picked connection completes.
pub type DoneCallback = Box<dyn FnOnce(DoneInfo) + Send>;

/// A selected connection.
pub struct PickResult {
    pub id: SubConnId,
    pub sub_conn: SubConnRef,
    pub node_id: NodeId,
    pub done: Option<DoneCallback>,
}

impl PickResult {
    /// Report the call outcome to the balancer, if it asked for it.
    pub fn finish(self, info: DoneInfo) {
        if let Some(done) = self.done {
            done(info);
        }
    }
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickResult")
            .field("id", &self.id)
            .field("sub_conn", &self.sub_conn)
            .field("node_id", &self.node_id)
            .field("done", &self.done.is_some())
            .finish()
    }
}

/// Selects a connection for one call.
pub trait Picker: Send + Sync + fmt::Debug {
    fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError>;
}

/// Picker that fails every call with the same error.
#[derive(Debug, Clone)]
pub struct ErrPicker {
    err: PickError,
}

impl ErrPicker {
    pub fn new(err: PickError) -> Self {
        Self { err }
    }
}

impl Picker for ErrPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, PickError> {
        metrics::record_pick(self.err.kind());
        Err(self.err.clone())
    }
}

/// Round-robin picker honouring preferred and excluded nodes.
#[derive(Debug)]
pub struct RoutingPicker {
    ids: Vec<SubConnId>,
    sub_conns: Vec<SubConnRef>,
    node_ids: Vec<NodeId>,
    next: AtomicUsize,
    fallback: ExclusionFallback,
}

impl RoutingPicker {
    /// Build a snapshot from `(id, connection, node)` triples.
    pub fn new(ready: Vec<(SubConnId, SubConnRef, NodeId)>, fallback: ExclusionFallback) -> Self {
        let mut ids = Vec::with_capacity(ready.len());
        let mut sub_conns = Vec::with_capacity(ready.len());
        let mut node_ids = Vec::with_capacity(ready.len());
        for (id, sub_conn, node_id) in ready {
            ids.push(id);
            sub_conns.push(sub_conn);
            node_ids.push(node_id);
        }

        Self {
            ids,
            sub_conns,
            node_ids,
            next: AtomicUsize::new(0),
            fallback,
        }
    }

    pub fn len(&self) -> usize {
        self.sub_conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_conns.is_empty()
    }

    /// Node ids in snapshot order.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    fn select(&self, info: &PickInfo) -> Result<(PickResult, &'static str), PickError> {
        if self.sub_conns.is_empty() {
            return Err(PickError::NoSubConnAvailable);
        }

        if let Some(preferred) = info.intent.preferred_node() {
            return match self.node_ids.iter().position(|n| n == preferred) {
                Some(i) => Ok((self.result(i, None), "preferred")),
                None => Err(PickError::PreferredNodeUnavailable(preferred.clone())),
            };
        }

        let excluded = match info.intent.excluded_node() {
            Some(node) if self.sub_conns.len() > 1 || self.fallback == ExclusionFallback::Fail => {
                node
            }
            _ => return Ok((self.pick_round_robin(), "round_robin")),
        };

        let candidates: Vec<usize> = self
            .node_ids
            .iter()
            .enumerate()
            .filter(|(_, node)| *node != excluded)
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return match self.fallback {
                ExclusionFallback::RoundRobin => {
                    tracing::debug!(
                        method = %info.method,
                        excluded = %excluded,
                        "Every connection is excluded, ignoring exclusion"
                    );
                    Ok((self.pick_round_robin(), "exclusion_ignored"))
                }
                ExclusionFallback::Fail => Err(PickError::AllCandidatesExcluded(excluded.clone())),
            };
        }

        let next = self.next.fetch_add(1, Ordering::Relaxed);
        let index = candidates[next % candidates.len()];
        Ok((self.result(index, None), "excluded"))
    }

    fn pick_round_robin(&self) -> PickResult {
        let next = self.next.fetch_add(1, Ordering::Relaxed);
        let index = next % self.sub_conns.len();

        let node = self.node_ids[index].clone();
        let done: DoneCallback = Box::new(move |info: DoneInfo| {
            metrics::record_call_done(node.as_str(), info.success);
        });
        self.result(index, Some(done))
    }

    fn result(&self, index: usize, done: Option<DoneCallback>) -> PickResult {
        PickResult {
            id: self.ids[index],
            sub_conn: self.sub_conns[index].clone(),
            node_id: self.node_ids[index].clone(),
            done,
        }
    }
}

impl Picker for RoutingPicker {
    fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError> {
        match self.select(info) {
            Ok((result, outcome)) => {
                metrics::record_pick(outcome);
                tracing::trace!(
                    method = %info.method,
                    node = %result.node_id,
                    addr = %result.sub_conn.address(),
                    outcome,
                    "Picked sub-connection"
                );
                Ok(result)
            }
            Err(e) => {
                metrics::record_pick(e.kind());
                Err(e)
            }
        }
    }
}
