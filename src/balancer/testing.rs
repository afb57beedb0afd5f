//! Test doubles for balancer unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::balancer::{BalancerState, ClientConn, PickError, PickInfo, PickResult};
use crate::resolver::Address;
use crate::transport::{ConnectivityState, SubConn, SubConnId, SubConnRef, TransportError};

#[derive(Debug)]
pub struct FakeSubConn {
    address: Address,
    pub connects: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl FakeSubConn {
    pub fn new(addr: &str) -> Self {
        Self::for_address(Address::new(addr))
    }

    pub fn for_address(address: Address) -> Self {
        Self {
            address,
            connects: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }
}

impl SubConn for FakeSubConn {
    fn address(&self) -> &Address {
        &self.address
    }

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records created sub-connections and published states.
#[derive(Default)]
pub struct RecordingClientConn {
    next_id: AtomicU64,
    pub created: Mutex<Vec<(SubConnId, Arc<FakeSubConn>)>>,
    pub states: Mutex<Vec<BalancerState>>,
    pub failing: Mutex<HashSet<String>>,
}

impl RecordingClientConn {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make creation fail for `addr`.
    pub fn fail_for(&self, addr: &str) {
        self.failing.lock().insert(addr.to_string());
    }

    pub fn allow(&self, addr: &str) {
        self.failing.lock().remove(addr);
    }

    /// Sub-connection created for `addr`, most recent first.
    pub fn sub_conn(&self, addr: &str) -> Option<(SubConnId, Arc<FakeSubConn>)> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(_, sc)| sc.address.addr == addr)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn publish_count(&self) -> usize {
        self.states.lock().len()
    }

    pub fn last_state(&self) -> Option<BalancerState> {
        self.states.lock().last().cloned()
    }

    pub fn last_connectivity(&self) -> Option<ConnectivityState> {
        self.last_state().map(|s| s.connectivity)
    }

    /// Pick through the most recently published picker.
    pub fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError> {
        match self.last_state() {
            Some(state) => state.picker.pick(info),
            None => Err(PickError::NoSubConnAvailable),
        }
    }
}

impl ClientConn for RecordingClientConn {
    fn new_sub_conn(&self, addr: &Address) -> Result<(SubConnId, SubConnRef), TransportError> {
        if self.failing.lock().contains(&addr.addr) {
            return Err(TransportError::Rejected(format!("refusing {}", addr)));
        }
        let id = SubConnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let sc = Arc::new(FakeSubConn::for_address(addr.clone()));
        self.created.lock().push((id, sc.clone()));
        Ok((id, sc))
    }

    fn update_state(&self, state: BalancerState) {
        self.states.lock().push(state);
    }
}
