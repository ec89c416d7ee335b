use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::server::ServerSpec;

/// 配置文件的顶层结构
///
/// `servers` 是可选的初始后端列表，宿主也可以在运行时通过 `add_server` 注册
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

/// 负载均衡器配置
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub algorithm: LoadBalanceAlgorithm,
    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// 指数退避因子，第 n 次重试等待 retry_delay * factor^(n-1)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 退避延迟上限
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub sticky_session: bool,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    /// 连续失败多少次后熔断
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_reset_timeout")]
    pub circuit_breaker_reset_timeout_ms: u64,
    /// 事件通道容量，慢订阅者超出容量后会丢失最旧的事件
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalanceAlgorithm::default(),
            health_check_enabled: true,
            health_check_interval_ms: default_health_check_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            backoff_factor: default_backoff_factor(),
            max_retry_delay_ms: default_max_retry_delay(),
            sticky_session: false,
            session_timeout_ms: default_session_timeout(),
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_reset_timeout_ms: default_circuit_breaker_reset_timeout(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

/// 负载均衡算法
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    /// 轮询
    #[default]
    RoundRobin,
    /// 最少连接
    LeastConnections,
    /// 平滑加权轮询
    WeightedRoundRobin,
    /// 按客户端标识哈希
    IpHash,
    /// 随机
    Random,
}

impl LoadBalanceAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceAlgorithm::RoundRobin => "round_robin",
            LoadBalanceAlgorithm::LeastConnections => "least_connections",
            LoadBalanceAlgorithm::WeightedRoundRobin => "weighted_round_robin",
            LoadBalanceAlgorithm::IpHash => "ip_hash",
            LoadBalanceAlgorithm::Random => "random",
        }
    }
}

impl std::fmt::Display for LoadBalanceAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行时的部分配置更新，未设置的字段保持原值
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ConfigUpdate {
    pub algorithm: Option<LoadBalanceAlgorithm>,
    pub health_check_enabled: Option<bool>,
    pub health_check_interval_ms: Option<u64>,
    pub health_check_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_retry_delay_ms: Option<u64>,
    pub sticky_session: Option<bool>,
    pub session_timeout_ms: Option<u64>,
    pub circuit_breaker_enabled: Option<bool>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_reset_timeout_ms: Option<u64>,
    pub event_buffer_size: Option<usize>,
}

impl ConfigUpdate {
    pub fn algorithm(mut self, algorithm: LoadBalanceAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    pub fn sticky_session(mut self, enabled: bool) -> Self {
        self.sticky_session = Some(enabled);
        self
    }

    pub fn circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = Some(enabled);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl LoadBalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn circuit_breaker_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_timeout_ms)
    }

    /// 计算第 `attempt` 次重试（从1开始）前的退避时间
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_nanos = self.retry_delay().as_nanos() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_nanos = base_nanos * self.backoff_factor.powi(exponent);
        let cap = self.max_retry_delay();

        if !delay_nanos.is_finite() || delay_nanos >= cap.as_nanos() as f64 {
            cap
        } else {
            Duration::from_nanos(delay_nanos.round() as u64)
        }
    }

    /// 合并部分更新，返回新配置（不修改自身）
    pub fn apply(&self, update: &ConfigUpdate) -> Self {
        let mut merged = self.clone();

        if let Some(algorithm) = update.algorithm {
            merged.algorithm = algorithm;
        }
        if let Some(enabled) = update.health_check_enabled {
            merged.health_check_enabled = enabled;
        }
        if let Some(interval) = update.health_check_interval_ms {
            merged.health_check_interval_ms = interval;
        }
        if let Some(timeout) = update.health_check_timeout_ms {
            merged.health_check_timeout_ms = timeout;
        }
        if let Some(max_retries) = update.max_retries {
            merged.max_retries = max_retries;
        }
        if let Some(delay) = update.retry_delay_ms {
            merged.retry_delay_ms = delay;
        }
        if let Some(factor) = update.backoff_factor {
            merged.backoff_factor = factor;
        }
        if let Some(cap) = update.max_retry_delay_ms {
            merged.max_retry_delay_ms = cap;
        }
        if let Some(sticky) = update.sticky_session {
            merged.sticky_session = sticky;
        }
        if let Some(timeout) = update.session_timeout_ms {
            merged.session_timeout_ms = timeout;
        }
        if let Some(enabled) = update.circuit_breaker_enabled {
            merged.circuit_breaker_enabled = enabled;
        }
        if let Some(threshold) = update.circuit_breaker_threshold {
            merged.circuit_breaker_threshold = threshold;
        }
        if let Some(timeout) = update.circuit_breaker_reset_timeout_ms {
            merged.circuit_breaker_reset_timeout_ms = timeout;
        }
        if let Some(size) = update.event_buffer_size {
            merged.event_buffer_size = size;
        }

        merged
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker_threshold == 0 {
            anyhow::bail!("circuit_breaker_threshold must be at least 1");
        }

        if self.health_check_interval_ms == 0 {
            anyhow::bail!("health_check_interval_ms cannot be 0");
        }

        if self.health_check_timeout_ms == 0 {
            anyhow::bail!("health_check_timeout_ms cannot be 0");
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            anyhow::bail!(
                "backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            );
        }

        if self.max_retry_delay_ms < self.retry_delay_ms {
            anyhow::bail!(
                "max_retry_delay_ms ({}) cannot be smaller than retry_delay_ms ({})",
                self.max_retry_delay_ms,
                self.retry_delay_ms
            );
        }

        if self.session_timeout_ms == 0 {
            anyhow::bail!("session_timeout_ms cannot be 0");
        }

        if self.event_buffer_size == 0 {
            anyhow::bail!("event_buffer_size cannot be 0");
        }

        Ok(())
    }
}

impl Config {
    /// 验证整个配置文件，包括初始服务器列表
    pub fn validate(&self) -> Result<()> {
        self.load_balancer.validate()?;

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                anyhow::bail!("Server '{}' is defined more than once", server.id);
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30_000
}

fn default_health_check_timeout() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_retry_delay() -> u64 {
    30_000
}

fn default_session_timeout() -> u64 {
    30 * 60 * 1_000 // 30分钟
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_reset_timeout() -> u64 {
    60_000
}

fn default_event_buffer_size() -> usize {
    1024
}
