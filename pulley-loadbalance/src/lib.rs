//! Pulley Load Balance Library
//!
//! This library provides the load balancing engine for Pulley including:
//! - Server registry with connection tracking
//! - Selection strategies (round robin, least connections, weighted, ip hash, random)
//! - Health checking
//! - Per-server circuit breaking
//! - Sticky sessions
//! - Request dispatch with retry and backoff
//! - Statistics and events

pub mod loadbalance;

// Re-export commonly used types
pub use loadbalance::{
    spawn_event_logger, CircuitBreakerSnapshot, CircuitState, EventEnvelope, HealthProbe,
    HealthStats, HealthSummary, LoadBalancer, LoadBalancerBuilder, LoadBalancerEvent,
    ServerStatistics, Statistics,
};
pub use pulley_core::{
    Clock, Config, ConfigUpdate, HealthStatus, LoadBalanceAlgorithm, LoadBalancerConfig,
    LoadBalancerError, ManualClock, Result, Server, ServerSpec, TokioClock,
};
