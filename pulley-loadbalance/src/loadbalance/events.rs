use chrono::{DateTime, Utc};
use pulley_core::{LoadBalancerConfig, Server};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 负载均衡器事件
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoadBalancerEvent {
    ServerAdded {
        server: Server,
    },
    ServerRemoved {
        server_id: String,
    },
    ServerSelected {
        server_id: String,
        client_key: String,
        attempt: u32,
        /// 是否来自会话粘性
        sticky: bool,
    },
    ServerHealthChanged {
        server_id: String,
        healthy: bool,
    },
    /// 某个服务器因熔断被跳过，仅用于诊断
    ServerSkipped {
        server_id: String,
        reason: String,
    },
    RequestCompleted {
        server_id: String,
        latency_ms: u64,
        attempt: u32,
    },
    RequestFailed {
        server_id: String,
        error: String,
        attempt: u32,
    },
    NoHealthyServers {
        client_key: String,
    },
    CircuitBreakerOpened {
        server_id: String,
        consecutive_failures: u32,
    },
    CircuitBreakerHalfOpen {
        server_id: String,
    },
    CircuitBreakerReset {
        server_id: String,
    },
    ConfigUpdated {
        config: LoadBalancerConfig,
    },
    Destroyed,
}

impl LoadBalancerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerAdded { .. } => "server_added",
            Self::ServerRemoved { .. } => "server_removed",
            Self::ServerSelected { .. } => "server_selected",
            Self::ServerHealthChanged { .. } => "server_health_changed",
            Self::ServerSkipped { .. } => "server_skipped",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
            Self::NoHealthyServers { .. } => "no_healthy_servers",
            Self::CircuitBreakerOpened { .. } => "circuit_breaker_opened",
            Self::CircuitBreakerHalfOpen { .. } => "circuit_breaker_half_open",
            Self::CircuitBreakerReset { .. } => "circuit_breaker_reset",
            Self::ConfigUpdated { .. } => "config_updated",
            Self::Destroyed => "destroyed",
        }
    }
}

/// 带时间戳的事件
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LoadBalancerEvent,
}

/// 事件总线
///
/// 基于 broadcast 通道，发布从不阻塞；没有订阅者时事件直接丢弃，
/// 落后太多的订阅者会收到 `Lagged` 并丢失最旧的事件
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, timestamp: DateTime<Utc>, event: LoadBalancerEvent) {
        // 没有订阅者时 send 返回错误，忽略即可
        let _ = self.sender.send(EventEnvelope { timestamp, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 把事件流写入 tracing 日志，直到通道关闭
pub fn spawn_event_logger(mut receiver: broadcast::Receiver<EventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => log_event(&envelope.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged behind, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event channel closed, stopping event logger");
                    break;
                }
            }
        }
    })
}

fn log_event(event: &LoadBalancerEvent) {
    match event {
        LoadBalancerEvent::ServerHealthChanged { server_id, healthy } => {
            if *healthy {
                info!("Server {} is healthy again", server_id);
            } else {
                warn!("Server {} became unhealthy", server_id);
            }
        }
        LoadBalancerEvent::RequestFailed {
            server_id,
            error,
            attempt,
        } => {
            warn!(
                "Request attempt {} on server {} failed: {}",
                attempt, server_id, error
            );
        }
        LoadBalancerEvent::NoHealthyServers { client_key } => {
            warn!("No healthy servers for client {}", client_key);
        }
        LoadBalancerEvent::CircuitBreakerOpened {
            server_id,
            consecutive_failures,
        } => {
            warn!(
                "Circuit opened for server {} ({} consecutive failures)",
                server_id, consecutive_failures
            );
        }
        LoadBalancerEvent::ServerAdded { server } => {
            info!("Server {} added at {}", server.id, server.address());
        }
        LoadBalancerEvent::ServerRemoved { server_id } => {
            info!("Server {} removed", server_id);
        }
        LoadBalancerEvent::CircuitBreakerReset { server_id } => {
            info!("Circuit reset for server {}", server_id);
        }
        LoadBalancerEvent::ConfigUpdated { config } => {
            info!("Configuration updated, algorithm: {}", config.algorithm);
        }
        LoadBalancerEvent::Destroyed => info!("Load balancer destroyed"),
        other => debug!("Load balancer event: {:?}", other),
    }
}
