use anyhow::Result;
use async_trait::async_trait;
use pulley_core::Server;
use std::future::Future;

/// 健康探测接口
///
/// 由宿主实现，负责真正的网络探测（HTTP GET、TCP connect 等）。
/// 返回 `Err` 表示不健康；超时由健康检查器统一处理
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, server: &Server) -> Result<()>;
}

/// 允许直接传入异步闭包 `|server| async move { ... }`
#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn(Server) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn probe(&self, server: &Server) -> Result<()> {
        (self)(server.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulley_core::HealthStatus;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct RejectPort(u16);

    #[async_trait]
    impl HealthProbe for RejectPort {
        async fn probe(&self, server: &Server) -> Result<()> {
            if server.port == self.0 {
                anyhow::bail!("port {} refused connection", server.port);
            }
            Ok(())
        }
    }

    fn server(port: u16) -> Server {
        Server {
            id: format!("s{}", port),
            host: "127.0.0.1".to_string(),
            port,
            weight: 1,
            max_connections: 100,
            active_connections: 0,
            is_healthy: true,
            health: HealthStatus::Unknown,
            last_health_check_at: None,
            last_response_time_ms: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_struct_probe() {
        let probe: Arc<dyn HealthProbe> = Arc::new(RejectPort(81));
        assert!(probe.probe(&server(80)).await.is_ok());
        assert!(probe.probe(&server(81)).await.is_err());
    }

    #[tokio::test]
    async fn test_closure_probe() {
        let probe: Arc<dyn HealthProbe> = Arc::new(|server: Server| async move {
            if server.port == 80 {
                Ok(())
            } else {
                Err(anyhow::anyhow!("unexpected port {}", server.port))
            }
        });

        assert!(probe.probe(&server(80)).await.is_ok());
        assert!(probe.probe(&server(90)).await.is_err());
    }
}
