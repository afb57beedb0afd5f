//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use routing_balancer::discovery::{MemoryRegistry, ServiceInstance};
use routing_balancer::resolver::Address;
use routing_balancer::transport::{
    ConnectivityState, Connector, StateListener, SubConn, SubConnRef, TransportError,
};

/// Sub-connection whose state is driven by the test.
#[derive(Debug)]
pub struct ManualSubConn {
    address: Address,
    listener: StateListener,
    pub connects: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl ManualSubConn {
    /// Deliver a transport state notification to the balancer.
    pub fn report(&self, state: ConnectivityState) {
        self.listener.report(state);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl SubConn for ManualSubConn {
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

/// Connector recording every sub-connection it creates.
#[derive(Default)]
pub struct ManualConnector {
    created: Mutex<Vec<Arc<ManualSubConn>>>,
}

impl ManualConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recent sub-connection created for `addr`.
    pub fn find(&self, addr: &str) -> Option<Arc<ManualSubConn>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|sc| sc.address.addr == addr)
            .cloned()
    }

    /// Wait until a sub-connection for `addr` exists and has been connected.
    pub async fn wait_for(&self, addr: &str) -> Arc<ManualSubConn> {
        let found = wait_until(Duration::from_secs(2), || {
            self.find(addr).map(|sc| sc.connect_count() > 0).unwrap_or(false)
        })
        .await;
        assert!(found, "no connected sub-connection for {}", addr);
        match self.find(addr) {
            Some(sc) => sc,
            None => panic!("sub-connection for {} disappeared", addr),
        }
    }
}

impl Connector for ManualConnector {
    fn new_sub_conn(
        &self,
        addr: &Address,
        listener: StateListener,
    ) -> Result<SubConnRef, TransportError> {
        let sc = Arc::new(ManualSubConn {
            address: addr.clone(),
            listener,
            connects: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        });
        self.created.lock().push(sc.clone());
        Ok(sc)
    }
}

/// Registry holding one service with the given `(node id, addr)` instances.
pub fn registry_with(service: &str, nodes: &[(&str, &str)]) -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::new());
    set_instances(&registry, service, nodes);
    registry
}

/// Replace the instances of `service`.
pub fn set_instances(registry: &MemoryRegistry, service: &str, nodes: &[(&str, &str)]) {
    let instances = nodes
        .iter()
        .map(|(id, addr)| ServiceInstance::new(*id, service, *addr))
        .collect();
    registry.sync_service(service, instances).unwrap();
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Start a TCP backend that accepts connections and keeps them open.
/// Aborting the returned handle closes the listener and every connection.
pub async fn start_mock_backend() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((socket, _)) => held.push(socket),
                Err(_) => break,
            }
        }
    });

    (addr, handle)
}
