use super::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState};
use super::events::{EventBus, EventEnvelope, LoadBalancerEvent};
use super::health_checker::{HealthChecker, HealthSummary};
use super::registry::ServerRegistry;
use super::selector::ServerSelector;
use super::session::SessionStore;
use super::stats::{HealthStats, Statistics, StatisticsCollector};
use super::traits::HealthProbe;
use parking_lot::{Mutex, RwLock};
use pulley_core::{
    Clock, Config, ConfigUpdate, HealthStatus, LoadBalancerConfig, LoadBalancerError, Result,
    Server, ServerSpec, TokioClock,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 负载均衡器
///
/// 整合服务器注册表、选择器、健康检查、熔断、会话粘性和统计，
/// 对宿主提供统一的接口。请求分发见 `handle_request`
pub struct LoadBalancer {
    pub(super) config: RwLock<LoadBalancerConfig>,
    pub(super) registry: Arc<ServerRegistry>,
    pub(super) selector: ServerSelector,
    pub(super) breakers: CircuitBreakerRegistry,
    pub(super) sessions: SessionStore,
    pub(super) stats: StatisticsCollector,
    pub(super) events: EventBus,
    pub(super) clock: Arc<dyn Clock>,
    health_checker: Option<Arc<HealthChecker>>,
    /// 所有后台任务的父 token，destroy 时取消
    shutdown: CancellationToken,
    /// 当前健康检查循环的 token，配置变化时替换
    health_token: Mutex<Option<CancellationToken>>,
    runtime: Mutex<Option<Handle>>,
    is_running: AtomicBool,
    destroyed: AtomicBool,
}

/// `LoadBalancer` 的构建器
pub struct LoadBalancerBuilder {
    config: LoadBalancerConfig,
    servers: Vec<ServerSpec>,
    clock: Option<Arc<dyn Clock>>,
    probe: Option<Arc<dyn HealthProbe>>,
    rng_seed: Option<u64>,
}

impl LoadBalancerBuilder {
    /// 默认使用 `TokioClock`
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 不设置探测器时不做健康检查，服务器保持 Unknown（视为健康）
    pub fn health_probe<P: HealthProbe>(mut self, probe: P) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn server(mut self, spec: ServerSpec) -> Self {
        self.servers.push(spec);
        self
    }

    pub fn servers(mut self, specs: impl IntoIterator<Item = ServerSpec>) -> Self {
        self.servers.extend(specs);
        self
    }

    pub fn build(self) -> Result<LoadBalancer> {
        self.config
            .validate()
            .map_err(|e| LoadBalancerError::InvalidConfig(e.to_string()))?;

        let config = self.config;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let registry = Arc::new(ServerRegistry::new());
        let events = EventBus::new(config.event_buffer_size);

        let selector = match self.rng_seed {
            Some(seed) => ServerSelector::with_rng_seed(seed),
            None => ServerSelector::new(),
        };

        let health_checker = self.probe.map(|probe| {
            Arc::new(HealthChecker::new(
                registry.clone(),
                probe,
                clock.clone(),
                events.clone(),
            ))
        });

        let breakers = CircuitBreakerRegistry::new(
            config.circuit_breaker_enabled,
            config.circuit_breaker_threshold,
            config.circuit_breaker_reset_timeout(),
            clock.clone(),
        );
        let sessions = SessionStore::new(config.session_timeout(), clock.clone());
        let stats = StatisticsCollector::new();

        for spec in self.servers {
            let server = registry.add(spec)?;
            breakers.register(&server.id);
            stats.register_server(&server.id);
        }

        debug!(
            "Built load balancer with {} servers, algorithm: {}",
            registry.len(),
            config.algorithm
        );

        Ok(LoadBalancer {
            config: RwLock::new(config),
            registry,
            selector,
            breakers,
            sessions,
            stats,
            events,
            clock,
            health_checker,
            shutdown: CancellationToken::new(),
            health_token: Mutex::new(None),
            runtime: Mutex::new(None),
            is_running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }
}

impl LoadBalancer {
    pub fn builder(config: LoadBalancerConfig) -> LoadBalancerBuilder {
        LoadBalancerBuilder {
            config,
            servers: Vec::new(),
            clock: None,
            probe: None,
            rng_seed: None,
        }
    }

    /// 从配置文件结构创建，包括初始服务器列表
    pub fn from_config(config: Config) -> LoadBalancerBuilder {
        Self::builder(config.load_balancer).servers(config.servers)
    }

    pub fn new(config: LoadBalancerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// 启动后台健康检查
    pub async fn start(&self) -> Result<()> {
        self.ensure_active()?;
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.runtime.lock() = Some(Handle::current());
        let config = self.config();
        self.spawn_health_checks(&config);

        info!(
            "Load balancer started with {} servers, algorithm: {}",
            self.registry.len(),
            config.algorithm
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// 停止健康检查，让之后的请求立即失败。可重复调用
    ///
    /// 正在进行的 `handle_request` 不会被中断
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        self.health_token.lock().take();
        self.is_running.store(false, Ordering::SeqCst);

        let sessions = self.sessions.clear_all();
        self.breakers.reset_all();

        info!("Load balancer destroyed, {} sessions released", sessions);
        self.publish(LoadBalancerEvent::Destroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ===== 服务器管理 =====

    pub fn add_server(&self, spec: ServerSpec) -> Result<Server> {
        self.ensure_active()?;
        let server = self.registry.add(spec)?;
        self.breakers.register(&server.id);
        self.stats.register_server(&server.id);

        info!("Added server {} ({})", server.id, server.address());
        self.publish(LoadBalancerEvent::ServerAdded {
            server: server.clone(),
        });
        Ok(server)
    }

    /// 移除服务器及其熔断状态、会话绑定和统计。不存在时返回 None
    pub fn remove_server(&self, id: &str) -> Option<Server> {
        let server = self.registry.remove(id)?;

        self.breakers.remove(id);
        let sessions = self.sessions.purge_server(id);
        self.stats.remove_server(id);
        self.selector.forget_server(id);

        info!(
            "Removed server {} ({} sessions released)",
            server.id, sessions
        );
        self.publish(LoadBalancerEvent::ServerRemoved {
            server_id: server.id.clone(),
        });
        Some(server)
    }

    pub fn get_server(&self, id: &str) -> Option<Server> {
        self.registry.get(id)
    }

    pub fn list_servers(&self) -> Vec<Server> {
        self.registry.list()
    }

    /// 健康且熔断器允许选择的服务器
    pub fn list_healthy_servers(&self) -> Vec<Server> {
        self.registry
            .list()
            .into_iter()
            .filter(|server| server.is_healthy && self.breakers.is_selectable(&server.id))
            .collect()
    }

    pub fn set_server_weight(&self, id: &str, weight: u32) -> Result<()> {
        self.registry.set_weight(id, weight)?;
        debug!("Server {} weight set to {}", id, weight);
        Ok(())
    }

    /// 手动覆盖健康状态，下一轮健康检查会重新判定
    pub fn set_server_health(&self, id: &str, healthy: bool) -> Result<()> {
        let status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        let update = self.registry.record_health(id, status, None, None)?;
        if update.changed() {
            info!(
                "Server {} manually marked {}",
                id,
                if healthy { "healthy" } else { "unhealthy" }
            );
            self.publish(LoadBalancerEvent::ServerHealthChanged {
                server_id: id.to_string(),
                healthy,
            });
        }
        Ok(())
    }

    // ===== 会话 =====

    pub fn clear_session(&self, client_key: &str) -> bool {
        self.sessions.clear(client_key)
    }

    pub fn clear_all_sessions(&self) -> usize {
        self.sessions.clear_all()
    }

    /// 当前绑定的服务器id，过期时返回 None
    pub fn session_server(&self, client_key: &str) -> Option<String> {
        self.sessions.resolve(client_key)
    }

    // ===== 配置 =====

    pub fn config(&self) -> LoadBalancerConfig {
        self.config.read().clone()
    }

    /// 应用部分配置更新
    ///
    /// 合并后的配置校验失败时返回 `InvalidConfig`，原配置保持不变。
    /// 成功后重置所有选择算法的游标
    pub fn update_config(&self, update: ConfigUpdate) -> Result<LoadBalancerConfig> {
        self.ensure_active()?;

        let (previous, next) = {
            let mut config = self.config.write();
            let next = config.apply(&update);
            next.validate()
                .map_err(|e| LoadBalancerError::InvalidConfig(e.to_string()))?;
            let previous = std::mem::replace(&mut *config, next.clone());
            (previous, next)
        };

        self.selector.reset();
        self.breakers.configure(
            next.circuit_breaker_enabled,
            next.circuit_breaker_threshold,
            next.circuit_breaker_reset_timeout(),
        );
        self.sessions.set_timeout(next.session_timeout());

        if previous.sticky_session && !next.sticky_session {
            let cleared = self.sessions.clear_all();
            debug!("Sticky sessions disabled, {} sessions cleared", cleared);
        }

        if previous.health_check_enabled && !next.health_check_enabled {
            let restored = self.reset_health_statuses();
            debug!("Health checking disabled, {} servers returned to unknown", restored);
        }

        if previous.event_buffer_size != next.event_buffer_size {
            warn!("event_buffer_size only takes effect when the load balancer is built");
        }

        let health_changed = previous.health_check_enabled != next.health_check_enabled
            || previous.health_check_interval_ms != next.health_check_interval_ms
            || previous.health_check_timeout_ms != next.health_check_timeout_ms;
        if health_changed && self.is_running() {
            self.spawn_health_checks(&next);
        }

        info!(
            "Load balancer configuration updated, algorithm: {}",
            next.algorithm
        );
        self.publish(LoadBalancerEvent::ConfigUpdated {
            config: next.clone(),
        });
        Ok(next)
    }

    // ===== 观测 =====

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot(&self.registry.list())
    }

    pub fn health_stats(&self) -> HealthStats {
        let servers = self.registry.list();
        let healthy = servers
            .iter()
            .filter(|server| server.is_healthy && self.breakers.is_selectable(&server.id))
            .count();
        HealthStats::new(healthy, &servers)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn circuit_state(&self, id: &str) -> CircuitState {
        self.breakers.state(id)
    }

    pub fn circuit_snapshot(&self, id: &str) -> CircuitBreakerSnapshot {
        self.breakers.snapshot(id)
    }

    /// 立即执行一轮健康检查，不影响定时循环
    pub async fn trigger_health_check(&self) -> Result<HealthSummary> {
        self.ensure_active()?;

        let Some(checker) = &self.health_checker else {
            debug!("No health probe installed, skipping health check");
            return Ok(HealthSummary::default());
        };

        let timeout = self.config.read().health_check_timeout();
        Ok(checker.check_now(timeout).await)
    }

    // ===== 内部 =====

    pub(super) fn ensure_active(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(LoadBalancerError::Destroyed);
        }
        Ok(())
    }

    pub(super) fn publish(&self, event: LoadBalancerEvent) {
        self.events.publish(self.clock.wall_clock(), event);
    }

    /// 所有服务器回到 Unknown，返回健康状态翻转的服务器数
    ///
    /// 关闭健康检查后不再有探测能把服务器恢复为健康
    fn reset_health_statuses(&self) -> usize {
        let mut flipped = 0;
        for server in self.registry.list() {
            let Ok(update) = self
                .registry
                .record_health(&server.id, HealthStatus::Unknown, None, None)
            else {
                // 并发移除
                continue;
            };

            if update.changed() {
                flipped += 1;
                self.publish(LoadBalancerEvent::ServerHealthChanged {
                    server_id: server.id,
                    healthy: update.current.is_healthy(),
                });
            }
        }
        flipped
    }

    /// 取消旧的检查循环，按新配置启动一个
    fn spawn_health_checks(&self, config: &LoadBalancerConfig) {
        let mut current = self.health_token.lock();
        if let Some(token) = current.take() {
            token.cancel();
        }

        let Some(checker) = &self.health_checker else {
            debug!("No health probe installed, health checking disabled");
            return;
        };

        if !config.health_check_enabled {
            info!("Health checking disabled by configuration");
            return;
        }

        let Some(runtime) = self.runtime.lock().clone() else {
            return;
        };

        let token = self.shutdown.child_token();
        let _enter = runtime.enter();
        checker.clone().spawn(
            config.health_check_interval(),
            config.health_check_timeout(),
            token.clone(),
        );
        *current = Some(token);
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
