//! In-process service registry.
//!
//! # Responsibilities
//! - Hold registered instances per service name
//! - Emit Add/Delete events to subscribers on change
//! - Replace a service's instance set in one call (static config, reloads)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::discovery::{DiscoveryError, Event, EventType, Registry, ServiceInstance};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
struct ServiceEntry {
    instances: HashMap<String, ServiceInstance>,
    events: broadcast::Sender<Event>,
}

impl ServiceEntry {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            instances: HashMap::new(),
            events,
        }
    }

    fn emit(&self, event_type: EventType, instance: ServiceInstance) {
        // No subscribers is fine.
        let _ = self.events.send(Event { event_type, instance });
    }
}

/// A registry living entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: DashMap<String, ServiceEntry>,
    closed: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), DiscoveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DiscoveryError::Closed);
        }
        Ok(())
    }

    /// Make `instances` the complete instance set of service `name`.
    ///
    /// Only the differences are emitted: a Delete for every instance id that
    /// disappeared, an Add for every new or changed instance.
    pub fn sync_service(
        &self,
        name: &str,
        instances: Vec<ServiceInstance>,
    ) -> Result<(), DiscoveryError> {
        self.ensure_open()?;

        let mut entry = self
            .services
            .entry(name.to_string())
            .or_insert_with(ServiceEntry::new);

        let wanted: HashMap<String, ServiceInstance> = instances
            .into_iter()
            .map(|si| (si.id.clone(), si))
            .collect();

        let removed: Vec<String> = entry
            .instances
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(old) = entry.instances.remove(&id) {
                entry.emit(EventType::Delete, old);
            }
        }

        for (id, instance) in wanted {
            if entry.instances.get(&id) == Some(&instance) {
                continue;
            }
            entry.instances.insert(id, instance.clone());
            entry.emit(EventType::Add, instance);
        }

        tracing::debug!(
            service = %name,
            instances = entry.instances.len(),
            "Service instance set synchronized"
        );
        Ok(())
    }

    /// Number of instances currently registered for `name`.
    pub fn instance_count(&self, name: &str) -> usize {
        self.services
            .get(name)
            .map(|e| e.instances.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, instance: ServiceInstance) -> Result<(), DiscoveryError> {
        self.ensure_open()?;

        let mut entry = self
            .services
            .entry(instance.name.clone())
            .or_insert_with(ServiceEntry::new);
        if entry.instances.get(&instance.id) == Some(&instance) {
            return Ok(());
        }
        tracing::info!(instance = %instance, addr = %instance.addr, "Instance registered");
        entry.instances.insert(instance.id.clone(), instance.clone());
        entry.emit(EventType::Add, instance);
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        self.ensure_open()?;

        if let Some(mut entry) = self.services.get_mut(&instance.name) {
            if let Some(old) = entry.instances.remove(&instance.id) {
                tracing::info!(instance = %old, "Instance deregistered");
                entry.emit(EventType::Delete, old);
            }
        }
        Ok(())
    }

    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.ensure_open()?;

        let mut instances: Vec<ServiceInstance> = self
            .services
            .get(name)
            .map(|e| e.instances.values().cloned().collect())
            .unwrap_or_default();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    fn subscribe(&self, name: &str) -> broadcast::Receiver<Event> {
        self.services
            .entry(name.to_string())
            .or_insert_with(ServiceEntry::new)
            .events
            .subscribe()
    }

    async fn close(&self) -> Result<(), DiscoveryError> {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders closes every subscription.
        self.services.clear();
        Ok(())
    }
}
