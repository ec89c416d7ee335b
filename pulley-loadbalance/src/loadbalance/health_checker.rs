use super::events::{EventBus, LoadBalancerEvent};
use super::registry::ServerRegistry;
use super::traits::HealthProbe;
use pulley_core::{Clock, HealthStatus, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 健康检查器
/// 定期探测所有服务器并把结果写回注册表
pub struct HealthChecker {
    registry: Arc<ServerRegistry>,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// 一轮健康检查的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// 健康状态发生翻转的服务器数
    pub transitions: usize,
}

impl HealthSummary {
    pub fn is_all_healthy(&self) -> bool {
        self.unhealthy == 0
    }
}

struct ProbeResult {
    healthy: bool,
    changed: bool,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServerRegistry>,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            probe,
            clock,
            events,
        }
    }

    /// 并发探测所有已注册的服务器
    pub async fn check_now(&self, timeout: Duration) -> HealthSummary {
        let servers = self.registry.list();
        debug!("Starting health check for {} servers", servers.len());

        let checks = servers
            .into_iter()
            .map(|server| self.check_server(server, timeout));
        let results = futures::future::join_all(checks).await;

        let mut summary = HealthSummary::default();
        for result in results.into_iter().flatten() {
            summary.checked += 1;
            if result.healthy {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }
            if result.changed {
                summary.transitions += 1;
            }
        }

        debug!(
            "Health check completed: {} checked, {} healthy, {} unhealthy, {} transitions",
            summary.checked, summary.healthy, summary.unhealthy, summary.transitions
        );
        summary
    }

    /// 探测单个服务器，服务器在探测期间被移除时返回 None
    async fn check_server(&self, server: Server, timeout: Duration) -> Option<ProbeResult> {
        let started = self.clock.now();

        let result = tokio::select! {
            biased;
            result = self.probe.probe(&server) => result,
            _ = self.clock.sleep(timeout) => Err(anyhow::anyhow!(
                "health check timed out after {}ms",
                timeout.as_millis()
            )),
        };

        let elapsed = self.clock.now().saturating_duration_since(started);
        let (status, response_time_ms) = match &result {
            Ok(()) => (HealthStatus::Healthy, Some(elapsed.as_millis() as u64)),
            Err(e) => {
                debug!("Health check failed for server {}: {}", server.id, e);
                (HealthStatus::Unhealthy, None)
            }
        };

        let update = match self.registry.record_health(
            &server.id,
            status,
            Some(self.clock.wall_clock()),
            response_time_ms,
        ) {
            Ok(update) => update,
            Err(_) => {
                debug!("Server {} was removed during health check", server.id);
                return None;
            }
        };

        let healthy = status.is_healthy();
        if update.changed() {
            if healthy {
                info!("Server {} recovered and is healthy again", server.id);
            } else {
                warn!("Server {} marked unhealthy: health check failed", server.id);
            }
            self.events.publish(
                self.clock.wall_clock(),
                LoadBalancerEvent::ServerHealthChanged {
                    server_id: server.id.clone(),
                    healthy,
                },
            );
        }

        Some(ProbeResult {
            healthy,
            changed: update.changed(),
        })
    }

    /// 启动后台检查循环：立即检查一次，之后每隔 `interval` 检查，
    /// 直到 token 被取消。取消时正在进行的探测也会被丢弃
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        timeout: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting health checker with interval: {:?}, timeout: {:?}",
                interval, timeout
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.check_now(timeout) => {}
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.clock.sleep(interval) => {}
                }
            }

            info!("Health checker stopped");
        })
    }
}
