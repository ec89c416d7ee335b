//! Pulley Core Library
//!
//! This library provides core functionality for the Pulley load balancing engine including:
//! - Configuration management
//! - Error types
//! - Server definitions and snapshots
//! - Clock abstraction

pub mod clock;
pub mod config;
pub mod error;
pub mod server;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::model::{Config, ConfigUpdate, LoadBalanceAlgorithm, LoadBalancerConfig};
pub use error::{LoadBalancerError, Result};
pub use server::{HealthStatus, Server, ServerSpec};
