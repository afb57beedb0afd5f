//! The routing round-robin balancer.
//!
//! # Responsibilities
//! - Apply resolver address sets as add/remove diffs
//! - Track sub-connection state and the usable set
//! - Publish a fresh `RoutingPicker` whenever the usable set may change
//!
//! # Design Decisions
//! - One lock per balancer, held for exactly one update
//! - `connect`/`shutdown` run after the lock is released
//! - Pickers are published while holding the lock so they land in order
//! - Unchanged addresses keep their connection (no churn)

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::balancer::registry::SubConnRegistry;
use crate::balancer::{
    Balancer, BalancerState, ClientConn, ErrPicker, ExclusionFallback, PickError, RoutingPicker,
};
use crate::observability::metrics;
use crate::resolver::{Address, ResolverState};
use crate::transport::{ConnectivityState, SubConnId, SubConnRef};

#[derive(Debug, Default)]
struct Inner {
    registry: SubConnRegistry,
    closed: bool,
}

pub struct RoutingBalancer {
    cc: Arc<dyn ClientConn>,
    fallback: ExclusionFallback,
    /// Target service, used as the metrics label.
    target: String,
    inner: Mutex<Inner>,
}

impl RoutingBalancer {
    pub fn new(cc: Arc<dyn ClientConn>, fallback: ExclusionFallback) -> Self {
        Self {
            cc,
            fallback,
            target: String::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Number of sub-connections currently owned.
    pub fn sub_conn_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// Number of sub-connections currently usable.
    pub fn ready_count(&self) -> usize {
        self.inner.lock().registry.ready_len()
    }

    /// Build and publish the state for the current usable set.
    /// Must be called with the lock held.
    fn publish(&self, registry: &SubConnRegistry) {
        let ready = registry.ready_snapshot();
        metrics::record_ready_sub_conns(&self.target, ready.len());

        let state = if ready.is_empty() {
            BalancerState {
                connectivity: ConnectivityState::TransientFailure,
                picker: Arc::new(ErrPicker::new(PickError::NoSubConnAvailable)),
            }
        } else {
            BalancerState {
                connectivity: ConnectivityState::Ready,
                picker: Arc::new(RoutingPicker::new(ready, self.fallback)),
            }
        };
        tracing::debug!(
            connectivity = %state.connectivity,
            ready = registry.ready_len(),
            total = registry.len(),
            "Publishing picker"
        );
        self.cc.update_state(state);
    }

    #[cfg(test)]
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&SubConnRegistry) -> R) -> R {
        f(&self.inner.lock().registry)
    }
}

impl Balancer for RoutingBalancer {
    fn update_client_conn_state(&self, state: ResolverState) {
        let mut to_connect: Vec<SubConnRef> = Vec::new();
        let mut to_shutdown: Vec<SubConnRef> = Vec::new();

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }

            let wanted: HashSet<Address> = state.addresses.iter().cloned().collect();

            let mut evicted_ready = false;
            for removed in inner.registry.retain(&wanted) {
                tracing::info!(
                    addr = %removed.address,
                    sub_conn = %removed.id,
                    "Address removed, shutting down sub-connection"
                );
                evicted_ready |= removed.was_ready;
                to_shutdown.push(removed.sub_conn);
            }

            let mut seen = HashSet::with_capacity(state.addresses.len());
            for addr in state.addresses {
                if !seen.insert(addr.clone()) || inner.registry.contains(&addr) {
                    continue;
                }
                match self.cc.new_sub_conn(&addr) {
                    Ok((id, sub_conn)) => {
                        let node_id = inner.registry.insert(addr.clone(), id, sub_conn.clone());
                        tracing::info!(
                            addr = %addr,
                            node = %node_id,
                            sub_conn = %id,
                            "Created sub-connection"
                        );
                        to_connect.push(sub_conn);
                    }
                    Err(e) => {
                        // Still absent, so the next update retries it.
                        tracing::warn!(addr = %addr, error = %e, "Failed to create sub-connection");
                    }
                }
            }

            // The evicted connection's Shutdown notification will be stale,
            // so the published picker has to drop it now.
            if evicted_ready {
                self.publish(&inner.registry);
            }
        }

        for sub_conn in to_shutdown {
            sub_conn.shutdown();
        }
        for sub_conn in to_connect {
            sub_conn.connect();
        }
    }

    fn resolver_error(&self, message: &str) {
        metrics::record_resolver_error();
        tracing::warn!(error = %message, "Resolver error, keeping current sub-connections");
    }

    fn update_sub_conn_state(&self, id: SubConnId, state: ConnectivityState) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        let Some(addr) = inner.registry.address_of(id).cloned() else {
            tracing::trace!(
                sub_conn = %id,
                state = %state,
                "Ignoring state change for removed sub-connection"
            );
            return;
        };

        metrics::record_sub_conn_transition(state.as_str());
        tracing::debug!(
            addr = %addr,
            sub_conn = %id,
            state = %state,
            "Sub-connection state changed"
        );

        match state {
            ConnectivityState::Ready => {
                inner.registry.mark_ready(id);
            }
            ConnectivityState::Idle
            | ConnectivityState::Connecting
            | ConnectivityState::TransientFailure => {
                inner.registry.mark_unready(id);
            }
            ConnectivityState::Shutdown => {
                inner.registry.remove_id(id);
            }
        }

        self.publish(&inner.registry);
    }

    fn close(&self) {
        let sub_conns = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let sub_conns = inner.registry.drain();
            metrics::record_ready_sub_conns(&self.target, 0);
            self.cc.update_state(BalancerState {
                connectivity: ConnectivityState::Shutdown,
                picker: Arc::new(ErrPicker::new(PickError::Closed)),
            });
            sub_conns
        };

        tracing::info!(sub_conns = sub_conns.len(), "Balancer closed");
        for sub_conn in sub_conns {
            sub_conn.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::testing::RecordingClientConn;
    use crate::observability::metrics::capture::CapturingRecorder;
    use crate::balancer::{PickInfo, RoutingIntent};
    use crate::resolver::NODE_ID_ATTRIBUTE;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn addr(host: &str, node: &str) -> Address {
        Address::new(host).with_attribute(NODE_ID_ATTRIBUTE, node)
    }

    fn update(addrs: &[Address]) -> ResolverState {
        ResolverState::new(addrs.to_vec())
    }

    fn setup(fallback: ExclusionFallback) -> (Arc<RecordingClientConn>, RoutingBalancer) {
        let cc = RecordingClientConn::new();
        let balancer = RoutingBalancer::new(cc.clone(), fallback);
        (cc, balancer)
    }

    fn id_of(cc: &RecordingClientConn, host: &str) -> SubConnId {
        cc.sub_conn(host).unwrap().0
    }

    #[test]
    fn test_update_creates_and_connects() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A"), addr("b:1", "B")]));

        assert_eq!(cc.created_count(), 2);
        assert_eq!(cc.sub_conn("a:1").unwrap().1.connects.load(Ordering::SeqCst), 1);
        // Usability unknown until notifications arrive.
        assert_eq!(cc.publish_count(), 0);
        assert_eq!(b.sub_conn_count(), 2);
        assert_eq!(b.ready_count(), 0);
    }

    #[test]
    fn test_unchanged_update_is_noop() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        let addrs = [addr("a:1", "A"), addr("b:1", "B")];
        b.update_client_conn_state(update(&addrs));
        b.update_client_conn_state(update(&addrs));

        assert_eq!(cc.created_count(), 2);
        let (_, a) = cc.sub_conn("a:1").unwrap();
        assert_eq!(a.connects.load(Ordering::SeqCst), 1);
        assert_eq!(a.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_addresses_create_one_sub_conn() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A"), addr("a:1", "A")]));
        assert_eq!(cc.created_count(), 1);
    }

    #[test]
    fn test_ready_publishes_picker() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A")]));
        b.update_sub_conn_state(id_of(&cc, "a:1"), ConnectivityState::Ready);

        assert_eq!(cc.last_connectivity(), Some(ConnectivityState::Ready));
        assert_eq!(cc.pick(&PickInfo::default()).unwrap().node_id.as_str(), "A");
    }

    #[test]
    fn test_transient_failure_removes_from_usable_set() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A")]));
        let id = id_of(&cc, "a:1");
        b.update_sub_conn_state(id, ConnectivityState::Ready);
        b.update_sub_conn_state(id, ConnectivityState::TransientFailure);

        assert_eq!(cc.last_connectivity(), Some(ConnectivityState::TransientFailure));
        assert_eq!(
            cc.pick(&PickInfo::default()).unwrap_err(),
            PickError::NoSubConnAvailable
        );
        // Still owned, it may recover.
        assert_eq!(b.sub_conn_count(), 1);

        b.update_sub_conn_state(id, ConnectivityState::Ready);
        assert!(cc.pick(&PickInfo::default()).is_ok());
    }

    #[test]
    fn test_shutdown_notification_removes_everywhere() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A")]));
        let id = id_of(&cc, "a:1");
        b.update_sub_conn_state(id, ConnectivityState::Ready);
        b.update_sub_conn_state(id, ConnectivityState::Shutdown);

        b.inspect(|reg| {
            assert!(reg.is_empty());
            assert_eq!(reg.ready_len(), 0);
            assert!(reg.address_of(id).is_none());
            assert!(reg.is_consistent());
        });
        assert!(cc.pick(&PickInfo::default()).is_err());
    }

    #[test]
    fn test_stale_notification_is_ignored() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_sub_conn_state(SubConnId(42), ConnectivityState::Ready);
        assert_eq!(cc.publish_count(), 0);
        assert_eq!(b.ready_count(), 0);
    }

    #[test]
    fn test_creation_failure_is_retried_on_next_update() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        cc.fail_for("a:1");
        let addrs = [addr("a:1", "A"), addr("b:1", "B")];

        b.update_client_conn_state(update(&addrs));
        assert_eq!(b.sub_conn_count(), 1);
        assert!(cc.sub_conn("a:1").is_none());

        cc.allow("a:1");
        b.update_client_conn_state(update(&addrs));
        assert_eq!(b.sub_conn_count(), 2);
        assert!(cc.sub_conn("a:1").is_some());
    }

    #[test]
    fn test_removed_address_is_shut_down_once_and_never_picked() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A"), addr("b:1", "B")]));
        let (a_id, a) = cc.sub_conn("a:1").unwrap();
        let b_id = id_of(&cc, "b:1");
        b.update_sub_conn_state(a_id, ConnectivityState::Ready);
        b.update_sub_conn_state(b_id, ConnectivityState::Ready);

        b.update_client_conn_state(update(&[addr("b:1", "B")]));
        // The transport's final notification arrives after removal.
        b.update_sub_conn_state(a_id, ConnectivityState::Shutdown);
        b.update_client_conn_state(update(&[addr("b:1", "B")]));

        for _ in 0..10 {
            assert_eq!(cc.pick(&PickInfo::default()).unwrap().node_id.as_str(), "B");
        }
        assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);
        b.inspect(|reg| assert!(reg.is_consistent()));
    }

    #[test]
    fn test_removing_unready_address_does_not_publish() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A")]));
        b.update_client_conn_state(update(&[]));
        assert_eq!(cc.publish_count(), 0);
        assert_eq!(cc.sub_conn("a:1").unwrap().1.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolver_error_keeps_connections() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A")]));
        b.update_sub_conn_state(id_of(&cc, "a:1"), ConnectivityState::Ready);
        let published = cc.publish_count();

        b.resolver_error("registry unreachable");

        assert_eq!(cc.publish_count(), published);
        assert_eq!(b.ready_count(), 1);
        assert_eq!(cc.sub_conn("a:1").unwrap().1.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resolver_error_counted_once() {
        let (_cc, b) = setup(ExclusionFallback::RoundRobin);
        let recorder = CapturingRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            b.resolver_error("registry unreachable");
        });
        assert_eq!(recorder.value("balancer_resolver_errors_total"), Some(1.0));
    }

    #[test]
    fn test_ready_gauge_labelled_with_target() {
        let cc = RecordingClientConn::new();
        let b =
            RoutingBalancer::new(cc.clone(), ExclusionFallback::RoundRobin).with_target("orders");
        b.update_client_conn_state(update(&[addr("a:1", "A"), addr("b:1", "B")]));

        let recorder = CapturingRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            b.update_sub_conn_state(id_of(&cc, "a:1"), ConnectivityState::Ready);
            b.update_sub_conn_state(id_of(&cc, "b:1"), ConnectivityState::Ready);
        });
        assert_eq!(recorder.value("balancer_ready_sub_conns{target=orders}"), Some(2.0));

        ::metrics::with_local_recorder(&recorder, || b.close());
        assert_eq!(recorder.value("balancer_ready_sub_conns{target=orders}"), Some(0.0));
    }

    #[test]
    fn test_close_shuts_down_everything_once() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("a:1", "A"), addr("b:1", "B")]));
        b.update_sub_conn_state(id_of(&cc, "a:1"), ConnectivityState::Ready);

        b.close();
        b.close();

        for host in ["a:1", "b:1"] {
            assert_eq!(cc.sub_conn(host).unwrap().1.shutdowns.load(Ordering::SeqCst), 1);
        }
        assert_eq!(cc.last_connectivity(), Some(ConnectivityState::Shutdown));
        assert_eq!(cc.pick(&PickInfo::default()).unwrap_err(), PickError::Closed);

        // Events after close are dropped.
        b.update_client_conn_state(update(&[addr("c:1", "C")]));
        assert_eq!(cc.created_count(), 2);
    }

    #[test]
    fn test_intent_through_published_picker() {
        let (cc, b) = setup(ExclusionFallback::RoundRobin);
        b.update_client_conn_state(update(&[addr("x:1", "X"), addr("y:1", "Y"), addr("z:1", "Z")]));
        for host in ["x:1", "y:1", "z:1"] {
            b.update_sub_conn_state(id_of(&cc, host), ConnectivityState::Ready);
        }

        let avoid_x =
            PickInfo::new("/svc/Call").with_intent(RoutingIntent::new().with_excluded_node("X"));
        for _ in 0..12 {
            assert_ne!(cc.pick(&avoid_x).unwrap().node_id.as_str(), "X");
        }

        let pin_z =
            PickInfo::new("/svc/Call").with_intent(RoutingIntent::new().with_preferred_node("Z"));
        assert_eq!(cc.pick(&pin_z).unwrap().node_id.as_str(), "Z");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Resolve(Vec<bool>),
        State(usize, u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(any::<bool>(), 6).prop_map(Op::Resolve),
            (0usize..32, 0u8..5).prop_map(|(i, s)| Op::State(i, s)),
        ]
    }

    fn state_from(code: u8) -> ConnectivityState {
        match code {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }

    proptest! {
        #[test]
        fn prop_maps_stay_consistent(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let (cc, b) = setup(ExclusionFallback::RoundRobin);
            let pool: Vec<Address> = (0..6)
                .map(|i| addr(&format!("10.0.0.{}:1", i), &format!("n{}", i)))
                .collect();

            for op in ops {
                match op {
                    Op::Resolve(mask) => {
                        let addrs: Vec<Address> = pool
                            .iter()
                            .zip(mask)
                            .filter(|(_, keep)| *keep)
                            .map(|(a, _)| a.clone())
                            .collect();
                        b.update_client_conn_state(ResolverState::new(addrs));
                    }
                    Op::State(i, code) => {
                        b.update_sub_conn_state(SubConnId(i as u64), state_from(code));
                    }
                }

                prop_assert!(b.inspect(|reg| reg.is_consistent()));

                // The published picker only holds connections that are
                // still registered and Ready.
                if let Some(state) = cc.last_state() {
                    let ready: HashSet<String> = b.inspect(|reg| {
                        reg.ready_snapshot().iter().map(|(_, _, n)| n.to_string()).collect()
                    });
                    for _ in 0..ready.len() {
                        match state.picker.pick(&PickInfo::default()) {
                            Ok(result) => prop_assert!(ready.contains(result.node_id.as_str())),
                            Err(e) => prop_assert_eq!(e, PickError::NoSubConnAvailable),
                        }
                    }
                }
            }

            // Every created sub-connection was shut down at most once.
            for (_, sc) in cc.created.lock().iter() {
                prop_assert!(sc.shutdowns.load(Ordering::SeqCst) <= 1);
            }
        }
    }
}
