pub mod circuit_breaker;
mod dispatcher;
pub mod events;
pub mod health_checker;
pub mod registry;
pub mod selector;
pub mod service;
pub mod session;
pub mod stats;
pub mod traits;


pub use circuit_breaker::{
    CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState, CircuitTransition,
};
pub use events::{spawn_event_logger, EventBus, EventEnvelope, LoadBalancerEvent};
pub use health_checker::{HealthChecker, HealthSummary};
pub use registry::{ConnectionGuard, HealthUpdate, ServerRegistry};
pub use selector::ServerSelector;
pub use service::{LoadBalancer, LoadBalancerBuilder};
pub use session::SessionStore;
pub use stats::{HealthStats, RequestOutcome, ServerStatistics, Statistics, StatisticsCollector};
pub use traits::HealthProbe;
