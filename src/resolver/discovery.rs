//! Registry-backed resolver.
//!
//! # Responsibilities
//! - List a service's instances (bounded by a timeout)
//! - Follow the registry subscription and keep the instance set current
//! - Push the full address set to the balancer after every change
//! - Report registry failures without touching connection state

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Sleep};

use crate::discovery::{DiscoveryError, Event, EventType, Registry, ServiceInstance};
use crate::resilience::backoff::Backoff;
use crate::resolver::{Address, ResolverSink, NODE_ID_ATTRIBUTE};

/// Outcome of one full listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Listed,
    Failed,
    SinkClosed,
}

/// Bridges a [`Registry`] to a balancer.
pub struct DiscoveryResolver {
    registry: Arc<dyn Registry>,
    timeout: Duration,
    backoff: Backoff,
}

impl DiscoveryResolver {
    pub fn new(registry: Arc<dyn Registry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            backoff: Backoff::default(),
        }
    }

    /// Delay schedule for re-listing after a failed listing.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Resolve `service` in a background task until `shutdown` fires or the
    /// balancer side goes away.
    pub fn spawn(
        self,
        service: String,
        sink: ResolverSink,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(service, sink, shutdown).await })
    }

    async fn run(self, service: String, sink: ResolverSink, mut shutdown: broadcast::Receiver<()>) {
        // Subscribe before listing so no event falls between the two.
        let mut events = self.registry.subscribe(&service);
        let mut instances = BTreeMap::new();

        // Armed only while the last listing failed.
        let retry = time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_pending = false;
        let mut failures: u32 = 0;

        let outcome = self.resync(&service, &mut instances, &sink).await;
        if !self.track(&service, outcome, &mut failures, retry.as_mut(), &mut retry_pending) {
            return;
        }

        loop {
            tokio::select! {
                received = events.recv() => {
                    let delivered = match received {
                        Ok(event) => self.apply_event(&service, event, &mut instances, &sink),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                service = %service,
                                skipped,
                                "Registry subscription lagged, re-listing"
                            );
                            let outcome = self.resync(&service, &mut instances, &sink).await;
                            self.track(
                                &service,
                                outcome,
                                &mut failures,
                                retry.as_mut(),
                                &mut retry_pending,
                            )
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!(service = %service, "Registry subscription closed");
                            break;
                        }
                    };
                    if !delivered {
                        break;
                    }
                }
                () = &mut retry, if retry_pending => {
                    retry_pending = false;
                    tracing::debug!(service = %service, attempt = failures, "Re-listing service");
                    let outcome = self.resync(&service, &mut instances, &sink).await;
                    let pending = &mut retry_pending;
                    if !self.track(&service, outcome, &mut failures, retry.as_mut(), pending) {
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!(service = %service, "Resolver received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Arm or disarm the re-list timer after a listing. Returns false once
    /// the balancer side is gone.
    fn track(
        &self,
        service: &str,
        outcome: Resync,
        failures: &mut u32,
        retry: Pin<&mut Sleep>,
        retry_pending: &mut bool,
    ) -> bool {
        match outcome {
            Resync::SinkClosed => false,
            Resync::Listed => {
                *failures = 0;
                *retry_pending = false;
                true
            }
            Resync::Failed => {
                *failures = failures.saturating_add(1);
                let delay = self.backoff.delay(*failures);
                tracing::debug!(
                    service = %service,
                    attempt = *failures,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling re-list"
                );
                retry.reset(Instant::now() + delay);
                *retry_pending = true;
                true
            }
        }
    }

    /// Replace the instance set with a fresh listing. On failure the last
    /// known set is kept and an error is reported instead.
    async fn resync(
        &self,
        service: &str,
        instances: &mut BTreeMap<String, ServiceInstance>,
        sink: &ResolverSink,
    ) -> Resync {
        let (delivered, outcome) = match self.list(service).await {
            Ok(listed) => {
                *instances = listed.into_iter().map(|si| (si.id.clone(), si)).collect();
                tracing::debug!(service = %service, instances = instances.len(), "Service listed");
                (sink.update(to_addresses(instances)), Resync::Listed)
            }
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Failed to list service instances");
                (sink.report_error(e.to_string()), Resync::Failed)
            }
        };
        if delivered {
            outcome
        } else {
            Resync::SinkClosed
        }
    }

    async fn list(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        match time::timeout(self.timeout, self.registry.list_services(service)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    fn apply_event(
        &self,
        service: &str,
        event: Event,
        instances: &mut BTreeMap<String, ServiceInstance>,
        sink: &ResolverSink,
    ) -> bool {
        match event.event_type {
            EventType::Add => {
                tracing::debug!(service = %service, instance = %event.instance, "Instance added");
                instances.insert(event.instance.id.clone(), event.instance);
            }
            EventType::Delete => {
                tracing::debug!(service = %service, instance = %event.instance, "Instance removed");
                instances.remove(&event.instance.id);
            }
            EventType::Unknown => {
                tracing::trace!(service = %service, "Ignoring registry event of unknown type");
                return true;
            }
        }
        sink.update(to_addresses(instances))
    }
}

/// Map an instance to the address the balancer dials.
pub fn instance_address(instance: &ServiceInstance) -> Address {
    let mut addr = Address::new(instance.addr.clone());
    for (key, value) in &instance.metadata {
        addr = addr.with_attribute(key.clone(), value.clone());
    }
    if !instance.version.is_empty() {
        addr = addr.with_attribute("version", instance.version.clone());
    }
    addr.with_attribute(NODE_ID_ATTRIBUTE, instance.id.clone())
}

fn to_addresses(instances: &BTreeMap<String, ServiceInstance>) -> Vec<Address> {
    instances.values().map(instance_address).collect()
}
