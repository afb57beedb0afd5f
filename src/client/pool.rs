//! One cached client per service name.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::balancer::BalancerRegistry;
use crate::client::{Channel, ChannelOptions, ClientError};
use crate::discovery::Registry;
use crate::transport::Connector;

type Creator<T> = Box<dyn Fn(Channel) -> T + Send + Sync>;

struct Cached<T> {
    channel: Channel,
    client: T,
}

/// Creates and caches typed clients, one balanced channel per service.
pub struct ClientPool<T> {
    registry: Arc<dyn Registry>,
    connector: Arc<dyn Connector>,
    balancers: BalancerRegistry,
    options: ChannelOptions,
    creator: Creator<T>,
    clients: DashMap<String, Cached<T>>,
}

impl<T: Clone> ClientPool<T> {
    pub fn new(
        registry: Arc<dyn Registry>,
        connector: Arc<dyn Connector>,
        balancers: BalancerRegistry,
        options: ChannelOptions,
        creator: impl Fn(Channel) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry,
            connector,
            balancers,
            options,
            creator: Box::new(creator),
            clients: DashMap::new(),
        }
    }

    /// The client for `service`, creating its channel on first use.
    ///
    /// Concurrent first calls may each build a channel; the first one stored
    /// wins and the others are closed.
    pub fn get(&self, service: &str) -> Result<T, ClientError> {
        if let Some(cached) = self.clients.get(service) {
            return Ok(cached.client.clone());
        }

        let channel = Channel::connect(
            service,
            self.registry.clone(),
            &self.balancers,
            self.connector.clone(),
            &self.options,
        )?;

        match self.clients.entry(service.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(
                    service = %service,
                    "Client created concurrently, discarding duplicate"
                );
                channel.close();
                Ok(existing.get().client.clone())
            }
            Entry::Vacant(slot) => {
                let client = (self.creator)(channel.clone());
                slot.insert(Cached {
                    channel,
                    client: client.clone(),
                });
                tracing::info!(service = %service, "Client created");
                Ok(client)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close every channel and forget every client.
    pub fn close(&self) {
        for cached in self.clients.iter() {
            cached.channel.close();
        }
        self.clients.clear();
    }
}
