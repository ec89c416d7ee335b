use super::circuit_breaker::CircuitTransition;
use super::events::LoadBalancerEvent;
use super::registry::ConnectionGuard;
use super::service::LoadBalancer;
use super::stats::RequestOutcome;
use pulley_core::{LoadBalancerConfig, LoadBalancerError, Result, Server};
use std::future::Future;
use tracing::{debug, warn};

impl LoadBalancer {
    /// 选择服务器并通过 `handler` 发送请求，失败时按指数退避重试
    ///
    /// 最多调用 `max_retries + 1` 次 handler，每次重试都重新选择服务器。
    /// 没有可用服务器时立即返回 `NoHealthyServers`，不进入重试；
    /// 所有尝试都失败时返回 `RetriesExhausted`，其 source 是最后一次的错误
    pub async fn handle_request<P, T, F, Fut>(
        &self,
        client_key: &str,
        payload: P,
        handler: F,
    ) -> Result<T>
    where
        P: Clone,
        F: Fn(Server, P) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.ensure_active()?;

        let config = self.config();
        let max_attempts = config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let server = match self.select_server(&config, client_key, attempt) {
                Ok(server) => server,
                Err(e) => {
                    warn!(
                        "No healthy servers available for client {} (attempt {})",
                        client_key, attempt
                    );
                    self.publish(LoadBalancerEvent::NoHealthyServers {
                        client_key: client_key.to_string(),
                    });
                    return Err(e);
                }
            };

            let result = self
                .run_attempt(&config, &server, client_key, attempt, payload.clone(), &handler)
                .await;

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            self.publish(LoadBalancerEvent::RequestFailed {
                server_id: server.id.clone(),
                error: error.to_string(),
                attempt,
            });

            if attempt >= max_attempts {
                warn!(
                    "Request for client {} failed after {} attempts: {}",
                    client_key, attempt, error
                );
                return Err(LoadBalancerError::retries_exhausted(attempt, error));
            }

            let delay = config.backoff_delay(attempt);
            debug!(
                "Attempt {} on server {} failed: {}, retrying in {:?}",
                attempt, server.id, error, delay
            );
            self.clock.sleep(delay).await;
        }
    }

    /// 一次尝试：占用连接、调用 handler、记录结果
    async fn run_attempt<P, T, F, Fut>(
        &self,
        config: &LoadBalancerConfig,
        server: &Server,
        client_key: &str,
        attempt: u32,
        payload: P,
        handler: &F,
    ) -> anyhow::Result<T>
    where
        F: Fn(Server, P) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // 服务器可能在选中后被移除
        let guard = ConnectionGuard::acquire(self.registry.clone(), &server.id)?;

        let started = self.clock.now();
        let result = handler(server.clone(), payload).await;
        let latency = self.clock.now().saturating_duration_since(started);
        let registered = guard.is_registered();
        drop(guard);

        if !registered {
            // 请求期间服务器被移除，结果不再计入它的统计、熔断和会话
            debug!(
                "Server {} was removed during the request, outcome not recorded",
                server.id
            );
            if result.is_ok() {
                self.publish(LoadBalancerEvent::RequestCompleted {
                    server_id: server.id.clone(),
                    latency_ms: latency.as_millis() as u64,
                    attempt,
                });
            }
            return result;
        }

        self.stats.record(&RequestOutcome {
            server_id: server.id.clone(),
            success: result.is_ok(),
            latency,
            attempt,
        });

        match &result {
            Ok(_) => {
                if self.breakers.record_success(&server.id) == CircuitTransition::Reset {
                    self.publish(LoadBalancerEvent::CircuitBreakerReset {
                        server_id: server.id.clone(),
                    });
                }

                if config.sticky_session {
                    self.sessions.bind(client_key, &server.id);
                }

                debug!(
                    "Request for client {} served by {} in {:?} (attempt {})",
                    client_key, server.id, latency, attempt
                );
                self.publish(LoadBalancerEvent::RequestCompleted {
                    server_id: server.id.clone(),
                    latency_ms: latency.as_millis() as u64,
                    attempt,
                });
            }
            Err(_) => match self.breakers.record_failure(&server.id) {
                CircuitTransition::Opened {
                    consecutive_failures,
                } => {
                    self.publish(LoadBalancerEvent::CircuitBreakerOpened {
                        server_id: server.id.clone(),
                        consecutive_failures,
                    });
                }
                CircuitTransition::Reopened => {
                    let snapshot = self.breakers.snapshot(&server.id);
                    self.publish(LoadBalancerEvent::CircuitBreakerOpened {
                        server_id: server.id.clone(),
                        consecutive_failures: snapshot.consecutive_failures,
                    });
                }
                _ => {}
            },
        }

        result
    }

    /// 选择本次尝试的服务器
    ///
    /// 第一次尝试优先使用会话绑定的服务器；熔断器拒绝的服务器被排除后重新选择
    fn select_server(
        &self,
        config: &LoadBalancerConfig,
        client_key: &str,
        attempt: u32,
    ) -> Result<Server> {
        let mut excluded: Vec<String> = Vec::new();

        if config.sticky_session && attempt == 1 {
            if let Some(server) = self.resolve_sticky(client_key) {
                if self.acquire_circuit(&server.id) {
                    self.publish_selected(&server, client_key, attempt, true);
                    return Ok(server);
                }
                excluded.push(server.id);
            }
        }

        loop {
            let candidates: Vec<Server> = self
                .list_healthy_servers()
                .into_iter()
                .filter(|server| !excluded.contains(&server.id))
                .collect();

            let server = self
                .selector
                .select(config.algorithm, &candidates, client_key)?;

            if self.acquire_circuit(&server.id) {
                self.publish_selected(&server, client_key, attempt, false);
                return Ok(server);
            }
            excluded.push(server.id);
        }
    }

    /// 会话绑定的服务器仍然可选时返回它
    fn resolve_sticky(&self, client_key: &str) -> Option<Server> {
        let server_id = self.sessions.resolve(client_key)?;
        let server = self.registry.get(&server_id)?;

        if server.is_healthy && self.breakers.is_selectable(&server.id) {
            Some(server)
        } else {
            debug!(
                "Sticky server {} for client {} is unavailable, reselecting",
                server_id, client_key
            );
            None
        }
    }

    fn acquire_circuit(&self, server_id: &str) -> bool {
        match self.breakers.try_acquire(server_id) {
            Ok(CircuitTransition::HalfOpened) => {
                self.publish(LoadBalancerEvent::CircuitBreakerHalfOpen {
                    server_id: server_id.to_string(),
                });
                true
            }
            Ok(_) => true,
            Err(e) => {
                debug!("Skipping server {}: {}", server_id, e);
                self.publish(LoadBalancerEvent::ServerSkipped {
                    server_id: server_id.to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn publish_selected(&self, server: &Server, client_key: &str, attempt: u32, sticky: bool) {
        self.publish(LoadBalancerEvent::ServerSelected {
            server_id: server.id.clone(),
            client_key: client_key.to_string(),
            attempt,
            sticky,
        });
    }
}
