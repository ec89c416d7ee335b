use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 注册后端服务器时使用的定义
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 软容量提示，不做强制限制
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ServerSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_max_connections(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 验证服务器定义
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Server has empty id");
        }

        if self.host.trim().is_empty() {
            anyhow::bail!("Server '{}' has empty host", self.id);
        }

        if self.weight == 0 {
            anyhow::bail!("Server '{}' has invalid weight 0 (must be >= 1)", self.id);
        }

        Ok(())
    }
}

/// 健康状态，首次探测之前为 Unknown（视为健康）
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

/// 服务器运行时快照
///
/// 由注册表复制生成，修改它不会影响注册表中的状态
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Server {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: usize,
    pub active_connections: usize,
    pub is_healthy: bool,
    pub health: HealthStatus,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_response_time_ms: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Server {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 是否已达到软容量上限
    pub fn is_at_capacity(&self) -> bool {
        self.max_connections > 0 && self.active_connections >= self.max_connections
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> usize {
    100
}
