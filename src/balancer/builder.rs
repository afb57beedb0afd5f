//! Balancer builders and the registry that selects them by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::balancer::{
    Balancer, ClientConn, ExclusionFallback, RoutingBalancer, ROUTING_ROUND_ROBIN,
};

/// Options handed to a builder for one channel.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Target the channel balances, for logs.
    pub target: String,
    pub exclusion_fallback: ExclusionFallback,
}

/// Creates balancers of one policy.
pub trait BalancerBuilder: Send + Sync {
    /// Policy name clients select this builder by.
    fn name(&self) -> &str;

    fn build(&self, cc: Arc<dyn ClientConn>, opts: &BuildOptions) -> Box<dyn Balancer>;
}

/// Builder for [`RoutingBalancer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutingBalancerBuilder;

impl BalancerBuilder for RoutingBalancerBuilder {
    fn name(&self) -> &str {
        ROUTING_ROUND_ROBIN
    }

    fn build(&self, cc: Arc<dyn ClientConn>, opts: &BuildOptions) -> Box<dyn Balancer> {
        tracing::debug!(
            target_service = %opts.target,
            fallback = ?opts.exclusion_fallback,
            "Building routing balancer"
        );
        Box::new(RoutingBalancer::new(cc, opts.exclusion_fallback).with_target(opts.target.clone()))
    }
}

/// Policy name → builder, populated when the client is set up.
#[derive(Clone, Default)]
pub struct BalancerRegistry {
    builders: HashMap<String, Arc<dyn BalancerBuilder>>,
}

impl BalancerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in policy.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RoutingBalancerBuilder));
        registry
    }

    /// Add `builder`, replacing any builder with the same name.
    pub fn register(&mut self, builder: Arc<dyn BalancerBuilder>) {
        let name = builder.name().to_string();
        if self.builders.insert(name.clone(), builder).is_some() {
            tracing::warn!(policy = %name, "Replacing registered balancer builder");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BalancerBuilder>> {
        self.builders.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for BalancerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalancerRegistry")
            .field("policies", &self.names())
            .finish()
    }
}
