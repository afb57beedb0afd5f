//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Balancer, resolver, transport produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Pick-path metrics are single atomic increments
//! - Log fields carry addr / node / sub_conn for correlation

pub mod logging;
pub mod metrics;
