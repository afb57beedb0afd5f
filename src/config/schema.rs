//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files and
//! default every field, so a minimal file only names what it changes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::{ExclusionFallback, ROUTING_ROUND_ROBIN};
use crate::discovery::ServiceInstance;

/// Root configuration of a balanced client.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Load-balancing policy selection.
    pub balancer: BalancerConfig,

    /// Target service and its statically known instances.
    pub discovery: DiscoveryConfig,

    /// Reference TCP transport settings.
    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Balancer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Registered policy name (e.g., "routing_round_robin").
    pub policy: String,

    /// Behaviour when an exclusion leaves no candidate.
    pub exclusion_fallback: ExclusionFallback,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            policy: ROUTING_ROUND_ROBIN.to_string(),
            exclusion_fallback: ExclusionFallback::RoundRobin,
        }
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service name to resolve.
    pub service: String,

    /// Timeout for listing a service, in milliseconds.
    pub timeout_ms: u64,

    /// Instances loaded into the in-memory registry.
    pub instances: Vec<InstanceConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service: "default".to_string(),
            timeout_ms: 3000,
            instances: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Instances as registry entries of `self.service`.
    pub fn service_instances(&self) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .map(|inst| {
                let mut si =
                    ServiceInstance::new(inst.id.clone(), self.service.clone(), inst.addr.clone());
                si.version = inst.version.clone();
                si.metadata = inst.metadata.clone();
                si
            })
            .collect()
    }
}

/// A statically configured service instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InstanceConfig {
    /// Node id of the instance.
    pub id: String,

    /// Instance address (e.g., "127.0.0.1:7001").
    pub addr: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// TCP transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Base delay for reconnect backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum delay for reconnect backoff in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            backoff_base_ms: 100,
            backoff_max_ms: 5000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive (e.g., "info", "routing_balancer=debug").
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
