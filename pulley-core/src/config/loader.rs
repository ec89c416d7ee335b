use crate::config::model::Config;
use anyhow::Context;
use tracing::info;

pub fn load_config() -> Result<Config, anyhow::Error> {
    load_config_from_path("pulley.toml")
}

pub fn load_config_from_path(config_path: &str) -> Result<Config, anyhow::Error> {
    let config_str = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file '{}'", config_path))?;
    let config = load_config_from_str(&config_str)
        .with_context(|| format!("invalid config file '{}'", config_path))?;

    info!(
        "Loaded config from {} ({} servers, algorithm: {})",
        config_path,
        config.servers.len(),
        config.load_balancer.algorithm
    );
    Ok(config)
}

/// 解析并校验 TOML 配置
pub fn load_config_from_str(config_str: &str) -> Result<Config, anyhow::Error> {
    let config: Config = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}
