//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Channel close / process signal
//!     → shutdown.rs (broadcast to every background task)
//!     → resolver task exits
//!     → balancer event loop closes the balancer (shuts down sub-connections)
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
