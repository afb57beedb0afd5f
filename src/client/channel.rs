//! A balanced channel to one target service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;

use crate::balancer::{
    Balancer, BalancerEvent, BalancerRegistry, BalancerState, BuildOptions, ClientConn,
    ExclusionFallback, PickError, PickInfo, PickResult, ROUTING_ROUND_ROBIN,
};
use crate::client::ClientError;
use crate::config::ClientConfig;
use crate::discovery::Registry;
use crate::lifecycle::Shutdown;
use crate::resolver::{Address, DiscoveryResolver, ResolverSink};
use crate::transport::{
    ConnectivityState, Connector, StateListener, SubConnId, SubConnRef, TransportError,
};

/// Per-channel settings.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Registered balancer policy name.
    pub policy: String,
    /// Bound on each registry listing.
    pub resolve_timeout: Duration,
    pub exclusion_fallback: ExclusionFallback,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            policy: ROUTING_ROUND_ROBIN.to_string(),
            resolve_timeout: Duration::from_secs(3),
            exclusion_fallback: ExclusionFallback::RoundRobin,
        }
    }
}

impl ChannelOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            policy: config.balancer.policy.clone(),
            resolve_timeout: config.discovery.timeout(),
            exclusion_fallback: config.balancer.exclusion_fallback,
        }
    }
}

/// The channel side of the balancer boundary.
struct ChannelCore {
    target: String,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<BalancerEvent>,
    next_id: AtomicU64,
    state: ArcSwap<BalancerState>,
    connectivity: watch::Sender<ConnectivityState>,
}

impl ClientConn for ChannelCore {
    fn new_sub_conn(&self, addr: &Address) -> Result<(SubConnId, SubConnRef), TransportError> {
        let id = SubConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = StateListener::new(id, self.events.clone());
        let sub_conn = self.connector.new_sub_conn(addr, listener)?;
        Ok((id, sub_conn))
    }

    fn update_state(&self, state: BalancerState) {
        let connectivity = state.connectivity;
        self.state.store(Arc::new(state));
        let previous = self.connectivity.send_replace(connectivity);
        if previous != connectivity {
            tracing::info!(
                target_service = %self.target,
                from = %previous,
                to = %connectivity,
                "Channel connectivity changed"
            );
        }
    }
}

struct ChannelInner {
    core: Arc<ChannelCore>,
    shutdown: Shutdown,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Handle to a balanced channel. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Build the balancer named by `options.policy` and start resolving
    /// `target` through `registry`.
    pub fn connect(
        target: impl Into<String>,
        registry: Arc<dyn Registry>,
        balancers: &BalancerRegistry,
        connector: Arc<dyn Connector>,
        options: &ChannelOptions,
    ) -> Result<Self, ClientError> {
        let target = target.into();
        let builder = balancers
            .get(&options.policy)
            .ok_or_else(|| ClientError::UnknownPolicy(options.policy.clone()))?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoRuntime)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connectivity, _) = watch::channel(ConnectivityState::Idle);
        let core = Arc::new(ChannelCore {
            target: target.clone(),
            connector,
            events: events_tx.clone(),
            next_id: AtomicU64::new(0),
            state: ArcSwap::from_pointee(BalancerState::connecting()),
            connectivity,
        });

        let balancer = builder.build(
            core.clone(),
            &BuildOptions {
                target: target.clone(),
                exclusion_fallback: options.exclusion_fallback,
            },
        );

        let shutdown = Shutdown::new();
        handle.spawn(run_events(balancer, events_rx, shutdown.subscribe()));
        DiscoveryResolver::new(registry, options.resolve_timeout).spawn(
            target.clone(),
            ResolverSink::new(events_tx),
            shutdown.subscribe(),
        );

        tracing::info!(target_service = %target, policy = %options.policy, "Channel created");
        Ok(Self {
            inner: Arc::new(ChannelInner { core, shutdown }),
        })
    }

    pub fn target(&self) -> &str {
        &self.inner.core.target
    }

    /// Aggregate connectivity last published by the balancer.
    pub fn state(&self) -> ConnectivityState {
        *self.inner.core.connectivity.borrow()
    }

    /// Select a connection for one call using the current picker.
    pub fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError> {
        self.inner.core.state.load().picker.pick(info)
    }

    /// Wait until the channel has at least one ready connection.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.inner.core.connectivity.subscribe();
        let outcome = time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectivityState::Ready | ConnectivityState::Shutdown)),
        )
        .await;

        match outcome.map(|reached| reached.map(|state| *state)) {
            Ok(Ok(ConnectivityState::Ready)) => Ok(()),
            Ok(_) => Err(ClientError::Closed(self.target().to_string())),
            Err(_) => Err(ClientError::NotReady {
                target: self.target().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Wait until the published connectivity equals `state`.
    pub async fn wait_for_state(&self, state: ConnectivityState, timeout: Duration) -> bool {
        let mut rx = self.inner.core.connectivity.subscribe();
        time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map(|reached| reached.is_ok())
            .unwrap_or(false)
    }

    /// Stop resolving and shut down every connection of this channel.
    pub fn close(&self) {
        if !self.inner.shutdown.is_triggered() {
            tracing::info!(target_service = %self.target(), "Closing channel");
        }
        self.inner.shutdown.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Whether both handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.target())
            .field("state", &self.state())
            .finish()
    }
}

async fn run_events(
    balancer: Box<dyn Balancer>,
    mut events: mpsc::UnboundedReceiver<BalancerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => balancer.handle_event(event),
                None => break,
            },
        }
    }
    balancer.close();
    tracing::debug!("Balancer event loop stopped");
}
