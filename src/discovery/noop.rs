//! Registry that knows no services.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::discovery::{DiscoveryError, Event, Registry, ServiceInstance};

/// Accepts registrations, lists nothing and never emits events.
#[derive(Debug)]
pub struct NoopRegistry {
    // Held so subscriptions stay open instead of closing immediately.
    events: broadcast::Sender<Event>,
}

impl NoopRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for NoopRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for NoopRegistry {
    async fn register(&self, _instance: ServiceInstance) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn deregister(&self, _instance: &ServiceInstance) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn list_services(&self, _name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        Ok(Vec::new())
    }

    fn subscribe(&self, _name: &str) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}
