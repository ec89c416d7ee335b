pub mod loader;
pub mod model;


pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{Config, ConfigUpdate, LoadBalanceAlgorithm, LoadBalancerConfig};
