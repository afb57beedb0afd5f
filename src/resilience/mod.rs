//! Resilience helpers for the transport.
//!
//! # Design Decisions
//! - Reconnects back off exponentially with jitter
//! - The balancer itself never retries picks; callers own their retry policy

pub mod backoff;
