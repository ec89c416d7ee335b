use parking_lot::{Mutex, RwLock};
use pulley_core::Server;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 单次尝试的结果，汇总进统计后丢弃
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub server_id: String,
    pub success: bool,
    pub latency: Duration,
    /// 从1开始
    pub attempt: u32,
}

/// 增量均值，避免累加和溢出
#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    fn add(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }
}

#[derive(Debug, Clone, Default)]
struct ServerCounters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    response_time: RunningMean,
    last_response_time_ms: Option<u64>,
}

/// 统计信息收集器
///
/// 每次尝试都计数；平均响应时间只统计成功的尝试。
/// 单服务器计数只为 `register_server` 登记过的服务器保存
#[derive(Default)]
pub struct StatisticsCollector {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    response_time: Mutex<RunningMean>,
    servers: RwLock<HashMap<String, ServerCounters>>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &RequestOutcome) {
        let latency_ms = outcome.latency.as_secs_f64() * 1000.0;

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if outcome.success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
            self.response_time.lock().add(latency_ms);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        let mut servers = self.servers.write();
        let Some(counters) = servers.get_mut(&outcome.server_id) else {
            return;
        };
        counters.total_requests += 1;
        counters.last_response_time_ms = Some(outcome.latency.as_millis() as u64);
        if outcome.success {
            counters.successful_requests += 1;
            counters.response_time.add(latency_ms);
        } else {
            counters.failed_requests += 1;
        }
    }

    /// 为新服务器建立空计数，已有的计数被清零
    pub fn register_server(&self, server_id: &str) {
        self.servers
            .write()
            .insert(server_id.to_string(), ServerCounters::default());
    }

    pub fn remove_server(&self, server_id: &str) {
        self.servers.write().remove(server_id);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// 结合注册表快照生成统计信息，按注册顺序排列
    pub fn snapshot(&self, servers: &[Server]) -> Statistics {
        let counters = self.servers.read();

        let per_server = servers
            .iter()
            .map(|server| {
                let c = counters.get(&server.id).cloned().unwrap_or_default();
                ServerStatistics {
                    server_id: server.id.clone(),
                    total_requests: c.total_requests,
                    successful_requests: c.successful_requests,
                    failed_requests: c.failed_requests,
                    success_rate: ratio(c.successful_requests, c.total_requests),
                    average_response_time_ms: c.response_time.mean,
                    last_response_time_ms: c.last_response_time_ms,
                    active_connections: server.active_connections,
                    is_healthy: server.is_healthy,
                }
            })
            .collect();

        Statistics {
            total_requests: self.total_requests(),
            successful_requests: self.successful_requests(),
            failed_requests: self.failed_requests(),
            average_response_time_ms: self.response_time.lock().mean,
            active_connections: servers.iter().map(|s| s.active_connections).sum(),
            servers: per_server,
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// 统计快照
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Statistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub active_connections: usize,
    pub servers: Vec<ServerStatistics>,
}

impl Statistics {
    pub fn server(&self, server_id: &str) -> Option<&ServerStatistics> {
        self.servers.iter().find(|s| s.server_id == server_id)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerStatistics {
    pub server_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// 0.0 ~ 1.0，无请求时为 0
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_response_time_ms: Option<u64>,
    pub active_connections: usize,
    pub is_healthy: bool,
}

/// 服务器池健康统计
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthStats {
    pub healthy_servers: usize,
    pub total_servers: usize,
    pub health_ratio: f64,
    /// 最近一次健康检查响应时间的平均值
    pub average_response_time: Option<Duration>,
}

impl HealthStats {
    pub fn new(healthy_servers: usize, servers: &[Server]) -> Self {
        let total_servers = servers.len();
        let probed: Vec<u64> = servers
            .iter()
            .filter_map(|s| s.last_response_time_ms)
            .collect();

        let average_response_time = if probed.is_empty() {
            None
        } else {
            Some(Duration::from_millis(
                probed.iter().sum::<u64>() / probed.len() as u64,
            ))
        };

        Self {
            healthy_servers,
            total_servers,
            health_ratio: ratio(healthy_servers as u64, total_servers as u64),
            average_response_time,
        }
    }

    /// 至少有一个可用服务器
    pub fn is_healthy(&self) -> bool {
        self.health_ratio > 0.0
    }

    pub fn is_fully_healthy(&self) -> bool {
        self.health_ratio >= 1.0
    }
}
