use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pulley_core::{HealthStatus, LoadBalancerError, Result, Server, ServerSpec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// 单个服务器的运行时状态
///
/// 连接数和权重是原子量，健康信息用独立的锁保护，
/// 不同服务器之间互不阻塞
struct ServerEntry {
    id: String,
    host: String,
    port: u16,
    max_connections: usize,
    metadata: HashMap<String, serde_json::Value>,
    weight: AtomicU32,
    active_connections: AtomicUsize,
    health: RwLock<HealthState>,
}

#[derive(Debug, Clone, Default)]
struct HealthState {
    status: HealthStatus,
    last_check_at: Option<DateTime<Utc>>,
    last_response_time_ms: Option<u64>,
}

impl ServerEntry {
    fn new(spec: ServerSpec) -> Self {
        Self {
            id: spec.id,
            host: spec.host,
            port: spec.port,
            max_connections: spec.max_connections,
            metadata: spec.metadata,
            weight: AtomicU32::new(spec.weight),
            active_connections: AtomicUsize::new(0),
            health: RwLock::new(HealthState::default()),
        }
    }

    fn snapshot(&self) -> Server {
        let health = self.health.read().clone();
        Server {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight.load(Ordering::Relaxed),
            max_connections: self.max_connections,
            active_connections: self.active_connections.load(Ordering::Acquire),
            is_healthy: health.status.is_healthy(),
            health: health.status,
            last_health_check_at: health.last_check_at,
            last_response_time_ms: health.last_response_time_ms,
            metadata: self.metadata.clone(),
        }
    }

    /// 已经为0时不做任何事
    fn release_connection(&self) -> usize {
        let result = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });

        match result {
            Ok(previous) => previous - 1,
            Err(_) => {
                warn!(
                    "Connection counter for server {} is already 0, ignoring decrement",
                    self.id
                );
                0
            }
        }
    }
}

/// 健康状态更新的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

impl HealthUpdate {
    /// 只有 is_healthy 真正翻转才算状态变化，Unknown -> Healthy 不算
    pub fn changed(&self) -> bool {
        self.previous.is_healthy() != self.current.is_healthy()
    }
}

/// 服务器注册表
///
/// 按注册顺序保存服务器，列表接口返回快照副本
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<Vec<Arc<ServerEntry>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务器，重复的id返回 `DuplicateServer`
    pub fn add(&self, spec: ServerSpec) -> Result<Server> {
        spec.validate()
            .map_err(|e| LoadBalancerError::InvalidServer(e.to_string()))?;

        let mut servers = self.servers.write();
        if servers.iter().any(|s| s.id == spec.id) {
            return Err(LoadBalancerError::DuplicateServer(spec.id));
        }

        let entry = Arc::new(ServerEntry::new(spec));
        let snapshot = entry.snapshot();
        servers.push(entry);

        debug!("Registered server {} ({})", snapshot.id, snapshot.address());
        Ok(snapshot)
    }

    /// 移除服务器，不存在时返回 None（幂等）
    pub fn remove(&self, id: &str) -> Option<Server> {
        let mut servers = self.servers.write();
        let index = servers.iter().position(|s| s.id == id)?;
        let entry = servers.remove(index);
        Some(entry.snapshot())
    }

    pub fn get(&self, id: &str) -> Option<Server> {
        self.entry(id).map(|entry| entry.snapshot())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.read().iter().any(|s| s.id == id)
    }

    /// 所有服务器的快照，按注册顺序
    pub fn list(&self) -> Vec<Server> {
        self.servers.read().iter().map(|s| s.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    pub fn increment_connections(&self, id: &str) -> Result<usize> {
        let entry = self.require(id)?;
        let count = entry.active_connections.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(count)
    }

    /// 减少活跃连接数，已经为0时不做任何事
    pub fn decrement_connections(&self, id: &str) -> Result<usize> {
        Ok(self.require(id)?.release_connection())
    }

    pub fn set_weight(&self, id: &str, weight: u32) -> Result<()> {
        if weight == 0 {
            return Err(LoadBalancerError::InvalidServer(format!(
                "Server '{}' cannot have weight 0",
                id
            )));
        }

        let entry = self.require(id)?;
        entry.weight.store(weight, Ordering::Relaxed);
        Ok(())
    }

    /// 写入一次健康检查结果
    pub fn record_health(
        &self,
        id: &str,
        status: HealthStatus,
        checked_at: Option<DateTime<Utc>>,
        response_time_ms: Option<u64>,
    ) -> Result<HealthUpdate> {
        let entry = self.require(id)?;
        let mut health = entry.health.write();
        let previous = health.status;

        health.status = status;
        if checked_at.is_some() {
            health.last_check_at = checked_at;
        }
        if response_time_ms.is_some() {
            health.last_response_time_ms = response_time_ms;
        }

        Ok(HealthUpdate {
            previous,
            current: status,
        })
    }

    fn entry(&self, id: &str) -> Option<Arc<ServerEntry>> {
        self.servers.read().iter().find(|s| s.id == id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<ServerEntry>> {
        self.entry(id)
            .ok_or_else(|| LoadBalancerError::ServerNotFound(id.to_string()))
    }
}

/// 活跃连接的RAII守卫
///
/// 持有获取连接时的那个服务器条目，请求future被取消时也会归还连接数。
/// 服务器在请求期间被移除并以相同id重新添加时，归还的是旧条目的计数
pub struct ConnectionGuard {
    registry: Arc<ServerRegistry>,
    entry: Arc<ServerEntry>,
}

impl ConnectionGuard {
    pub fn acquire(registry: Arc<ServerRegistry>, server_id: &str) -> Result<Self> {
        let entry = registry.require(server_id)?;
        entry.active_connections.fetch_add(1, Ordering::AcqRel);
        Ok(Self { registry, entry })
    }

    pub fn server_id(&self) -> &str {
        &self.entry.id
    }

    /// 获取连接时的服务器是否仍在注册表中
    ///
    /// 被移除后重新添加的同名服务器是新的条目，返回 false
    pub fn is_registered(&self) -> bool {
        self.registry
            .servers
            .read()
            .iter()
            .any(|entry| Arc::ptr_eq(entry, &self.entry))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.entry.release_connection();
    }
}
