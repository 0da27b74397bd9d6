/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error
/// 数据面代码据此决定关闭哪一侧连接
use std::io;
use thiserror::Error;

/// Nvelox 的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 后端池中没有健康的服务器
    #[error("no healthy servers available")]
    NoHealthyServers,

    /// 后端连接失败
    #[error("backend connect failed: {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 后端池不存在
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// 拨号期间的客户端缓冲区超限
    #[error("ingress buffer overflow ({0} bytes)")]
    BufferOverflow(usize),

    /// 配置错误
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// 超时错误
    #[error("operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// PROXY v2 头：源/目的地址族不一致
    #[error("proxy protocol v2: address family mismatch")]
    FamilyMismatch,

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为无健康服务器错误
    pub fn is_no_healthy_servers(&self) -> bool {
        matches!(self, Self::NoHealthyServers)
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}
