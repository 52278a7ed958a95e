/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，每一种失败都对应一个明确的客户端响应
use http::StatusCode;
use std::io;
use thiserror::Error;

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 目标不可达或连接超时
    #[error("dial tcp {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 无法接管客户端的原始连接
    #[error("Hijacking not supported")]
    HijackUnsupported,

    /// 出站 HTTP 请求失败
    #[error("{0}")]
    Transport(String),

    /// 数据中继失败（响应头已发出，只记录日志）
    #[error("{description}: {source}")]
    Copy {
        description: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建连接失败错误
    pub fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }

    /// 创建传输失败错误
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// 创建中继失败错误
    pub fn copy(description: impl Into<String>, source: io::Error) -> Self {
        Self::Copy {
            description: description.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 返回给客户端的状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Dial { .. } | Self::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::HijackUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Copy { .. } | Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 检查是否为连接失败
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, Self::Dial { .. })
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Dial { source, .. } | Self::Copy { source, .. } | Self::Io(source) => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}
