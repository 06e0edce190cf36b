use std::fmt;

#[derive(Debug)]
pub enum MedsyncSDKError {
    /// 网络不可用且请求不可入队（只读请求无缓存可用）
    Connectivity(String),
    /// 4xx 客户端错误 - 不重试，立即上报
    Client { status: u16, message: String },
    /// 5xx 服务端错误 - 可重试
    Server { status: u16, message: String },
    /// 持久化失败（存储不可用 / 配额耗尽，已尝试淘汰低优先级缓存）
    Persistence(String),
    /// 同步过程的首个致命错误
    Sync(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Transport(String),
    Timeout(String),
    InvalidOperation(String),
    // SDK 相关错误
    Config(String),         // 配置错误
    NotInitialized(String), // 未初始化错误
    ShuttingDown(String),   // 正在关闭错误
}

impl fmt::Display for MedsyncSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MedsyncSDKError::Connectivity(e) => write!(f, "Connectivity error: {}", e),
            MedsyncSDKError::Client { status, message } => {
                write!(f, "Client error [{}]: {}", status, message)
            }
            MedsyncSDKError::Server { status, message } => {
                write!(f, "Server error [{}]: {}", status, message)
            }
            MedsyncSDKError::Persistence(e) => write!(f, "Persistence error: {}", e),
            MedsyncSDKError::Sync(e) => write!(f, "Sync error: {}", e),
            MedsyncSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            MedsyncSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MedsyncSDKError::IO(e) => write!(f, "IO error: {}", e),
            MedsyncSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            MedsyncSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            MedsyncSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            MedsyncSDKError::Config(e) => write!(f, "Config error: {}", e),
            MedsyncSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            MedsyncSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for MedsyncSDKError {}

impl From<serde_json::Error> for MedsyncSDKError {
    fn from(error: serde_json::Error) -> Self {
        MedsyncSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for MedsyncSDKError {
    fn from(error: std::io::Error) -> Self {
        MedsyncSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for MedsyncSDKError {
    fn from(error: sled::Error) -> Self {
        MedsyncSDKError::KvStore(error.to_string())
    }
}

impl MedsyncSDKError {
    /// 获取 HTTP 状态码（如果这是一个 HTTP 层错误）
    pub fn status(&self) -> Option<u16> {
        match self {
            MedsyncSDKError::Client { status, .. } => Some(*status),
            MedsyncSDKError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 判断是否是 4xx 客户端错误
    pub fn is_client_error(&self) -> bool {
        matches!(self, MedsyncSDKError::Client { .. })
    }

    /// 从 HTTP 状态码创建对应的错误
    pub fn from_status(status: u16, message: String) -> Self {
        if (400..500).contains(&status) {
            MedsyncSDKError::Client { status, message }
        } else {
            MedsyncSDKError::Server { status, message }
        }
    }
}

pub type Result<T> = std::result::Result<T, MedsyncSDKError>;
