//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the policy name against the balancer registry
//! - Validate value ranges (timeouts > 0, backoff ordering)
//! - Detect duplicate instance ids
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;

use thiserror::Error;

use crate::balancer::BalancerRegistry;
use crate::config::schema::ClientConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown balancer policy '{0}'")]
    UnknownPolicy(String),

    #[error("discovery.service must not be empty")]
    EmptyService,

    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error("transport.backoff_base_ms ({base}) exceeds transport.backoff_max_ms ({max})")]
    BackoffOrder { base: u64, max: u64 },

    #[error("instance #{index} has an empty {field}")]
    EmptyInstanceField { index: usize, field: &'static str },

    #[error("instance address '{0}' is not host:port")]
    InvalidInstanceAddress(String),

    #[error("duplicate instance id '{0}'")]
    DuplicateInstance(String),

    #[error("invalid metrics address '{0}'")]
    InvalidMetricsAddress(String),
}

/// Validate `config` against the built-in balancer policies.
pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    validate_config_with(config, &BalancerRegistry::with_defaults())
}

/// Validate `config` against the policies in `balancers`.
pub fn validate_config_with(
    config: &ClientConfig,
    balancers: &BalancerRegistry,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !balancers.contains(&config.balancer.policy) {
        errors.push(ValidationError::UnknownPolicy(config.balancer.policy.clone()));
    }

    if config.discovery.service.trim().is_empty() {
        errors.push(ValidationError::EmptyService);
    }
    if config.discovery.timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue { field: "discovery.timeout_ms" });
    }

    let mut ids = HashSet::new();
    for (index, inst) in config.discovery.instances.iter().enumerate() {
        if inst.id.is_empty() {
            errors.push(ValidationError::EmptyInstanceField { index, field: "id" });
        } else if !ids.insert(inst.id.as_str()) {
            errors.push(ValidationError::DuplicateInstance(inst.id.clone()));
        }

        if inst.addr.is_empty() {
            errors.push(ValidationError::EmptyInstanceField { index, field: "addr" });
        } else if !is_host_port(&inst.addr) {
            errors.push(ValidationError::InvalidInstanceAddress(inst.addr.clone()));
        }
    }

    let transport = &config.transport;
    if transport.connect_timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue { field: "transport.connect_timeout_ms" });
    }
    if transport.backoff_base_ms == 0 {
        errors.push(ValidationError::ZeroValue { field: "transport.backoff_base_ms" });
    }
    if transport.backoff_base_ms > transport.backoff_max_ms {
        errors.push(ValidationError::BackoffOrder {
            base: transport.backoff_base_ms,
            max: transport.backoff_max_ms,
        });
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
