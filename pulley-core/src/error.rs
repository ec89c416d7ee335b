use thiserror::Error;

/// 负载均衡引擎的错误类型
#[derive(Error, Debug)]
pub enum LoadBalancerError {
    #[error("server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("server '{0}' not found")]
    ServerNotFound(String),

    #[error("no healthy servers available")]
    NoHealthyServers,

    /// 所有尝试都失败，`source` 是最后一次处理器错误
    #[error("request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// 仅用于诊断事件，调用方不会直接收到
    #[error("circuit breaker for server '{0}' is open")]
    CircuitOpen(String),

    #[error("invalid server definition: {0}")]
    InvalidServer(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("load balancer has been destroyed")]
    Destroyed,
}

impl LoadBalancerError {
    /// 包装最后一次处理器错误
    pub fn retries_exhausted(attempts: u32, last_error: anyhow::Error) -> Self {
        Self::RetriesExhausted {
            attempts,
            source: last_error.into(),
        }
    }

    /// 同一请求换一台服务器是否可能成功
    ///
    /// 只有单台服务器的熔断属于这种情况；`RetriesExhausted` 已经用完重试次数，
    /// 结构性错误也会立即返回
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// 错误种类的稳定名称，用于事件和日志
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateServer(_) => "duplicate_server",
            Self::ServerNotFound(_) => "server_not_found",
            Self::NoHealthyServers => "no_healthy_servers",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::CircuitOpen(_) => "circuit_open",
            Self::InvalidServer(_) => "invalid_server",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Destroyed => "destroyed",
        }
    }
}

pub type Result<T, E = LoadBalancerError> = std::result::Result<T, E>;
