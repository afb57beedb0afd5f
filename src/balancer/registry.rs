//! Sub-connection bookkeeping.
//!
//! # Responsibilities
//! - Map addresses to sub-connections and back
//! - Remember the node id derived for each address
//! - Track which sub-connections are Ready (the usable set)
//!
//! # Design Decisions
//! - Not synchronized itself; the owning balancer holds it behind one lock
//! - Every removal path clears all four maps together
//! - The usable set is ordered by id so snapshots follow creation order

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::balancer::NodeId;
use crate::resolver::Address;
use crate::transport::{SubConnId, SubConnRef};

#[derive(Debug, Clone)]
struct SubConnEntry {
    id: SubConnId,
    sub_conn: SubConnRef,
}

/// A sub-connection taken out of the registry.
#[derive(Debug)]
pub struct Removed {
    pub id: SubConnId,
    pub address: Address,
    pub sub_conn: SubConnRef,
    /// Whether it was in the usable set at removal time.
    pub was_ready: bool,
}

#[derive(Debug, Default)]
pub struct SubConnRegistry {
    /// address → sub-connection
    sub_conns: HashMap<Address, SubConnEntry>,
    /// sub-connection → address
    addrs: HashMap<SubConnId, Address>,
    /// address → node id
    node_ids: HashMap<Address, NodeId>,
    /// Ready sub-connections and their node ids.
    ready: BTreeMap<SubConnId, NodeId>,
}

impl SubConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sub_conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_conns.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.sub_conns.contains_key(addr)
    }

    pub fn address_of(&self, id: SubConnId) -> Option<&Address> {
        self.addrs.get(&id)
    }

    pub fn node_id(&self, addr: &Address) -> Option<&NodeId> {
        self.node_ids.get(addr)
    }

    pub fn is_ready(&self, id: SubConnId) -> bool {
        self.ready.contains_key(&id)
    }

    /// Record a freshly created sub-connection for `addr`.
    pub fn insert(&mut self, addr: Address, id: SubConnId, sub_conn: SubConnRef) -> NodeId {
        let node_id = addr.node_id();
        self.addrs.insert(id, addr.clone());
        self.node_ids.insert(addr.clone(), node_id.clone());
        self.sub_conns.insert(addr, SubConnEntry { id, sub_conn });
        node_id
    }

    /// Move `id` into the usable set. Returns false for unknown ids.
    pub fn mark_ready(&mut self, id: SubConnId) -> bool {
        let Some(node_id) = self
            .addrs
            .get(&id)
            .and_then(|addr| self.node_ids.get(addr))
            .cloned()
        else {
            return false;
        };
        self.ready.insert(id, node_id);
        true
    }

    /// Take `id` out of the usable set, keeping the connection.
    pub fn mark_unready(&mut self, id: SubConnId) -> bool {
        self.ready.remove(&id).is_some()
    }

    /// Remove the sub-connection for `addr` from every map.
    pub fn remove_address(&mut self, addr: &Address) -> Option<Removed> {
        let entry = self.sub_conns.remove(addr)?;
        self.addrs.remove(&entry.id);
        self.node_ids.remove(addr);
        let was_ready = self.ready.remove(&entry.id).is_some();
        Some(Removed {
            id: entry.id,
            address: addr.clone(),
            sub_conn: entry.sub_conn,
            was_ready,
        })
    }

    /// Remove the sub-connection `id` from every map.
    pub fn remove_id(&mut self, id: SubConnId) -> Option<Removed> {
        let addr = self.addrs.get(&id)?.clone();
        self.remove_address(&addr)
    }

    /// Remove every address not in `wanted`.
    pub fn retain(&mut self, wanted: &HashSet<Address>) -> Vec<Removed> {
        let gone: Vec<Address> = self
            .sub_conns
            .keys()
            .filter(|addr| !wanted.contains(*addr))
            .cloned()
            .collect();
        gone.iter()
            .filter_map(|addr| self.remove_address(addr))
            .collect()
    }

    /// Empty the registry, returning every sub-connection it owned.
    pub fn drain(&mut self) -> Vec<SubConnRef> {
        self.addrs.clear();
        self.node_ids.clear();
        self.ready.clear();
        self.sub_conns.drain().map(|(_, entry)| entry.sub_conn).collect()
    }

    /// Ready sub-connections in id order.
    pub fn ready_snapshot(&self) -> Vec<(SubConnId, SubConnRef, NodeId)> {
        self.ready
            .iter()
            .filter_map(|(id, node_id)| {
                let addr = self.addrs.get(id)?;
                let entry = self.sub_conns.get(addr)?;
                Some((*id, entry.sub_conn.clone(), node_id.clone()))
            })
            .collect()
    }

    /// Check that the maps agree with each other.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.sub_conns.iter().all(|(addr, entry)| {
            self.addrs.get(&entry.id) == Some(addr) && self.node_ids.contains_key(addr)
        });
        let reverse_ok = self
            .addrs
            .iter()
            .all(|(id, addr)| self.sub_conns.get(addr).map(|e| e.id) == Some(*id));
        let ready_ok = self.ready.iter().all(|(id, node_id)| {
            self.addrs
                .get(id)
                .and_then(|addr| self.node_ids.get(addr))
                == Some(node_id)
        });

        forward_ok
            && reverse_ok
            && ready_ok
            && self.sub_conns.len() == self.addrs.len()
            && self.node_ids.len() == self.sub_conns.len()
    }
}
