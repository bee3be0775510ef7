use std::fmt;

use crate::collections::Collection;

#[derive(Debug)]
pub enum SyncError {
    // 存储初始化失败（致命：存储不可用 / 权限被拒绝），必须阻断依赖本地存储的界面
    StoreInit(String),
    // 单个集合拉取失败（非致命，计入 failed_count / last_error）
    PullCollection {
        collection: Collection,
        reason: String,
    },
    // 直接写远端失败（触发 outbox 入队，不作为数据丢失上报）
    WriteFailure(String),
    // 重放重试次数耗尽（条目保留，等待人工处理）
    ReplayExhausted {
        entry_id: String,
        attempts: u32,
        last_error: String,
    },
    // 推送通道断开（非致命，触发有界重连）
    ChannelDropped(String),

    SqliteError(rusqlite::Error),
    KvStore(String),
    Database(String),
    JsonError(String),
    IO(String),
    Network(String),
    Timeout(String),
    Http {
        status: u16,
        message: String,
    },
    ServerError(String),
    InvalidData(String),
    InvalidArgument(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::StoreInit(e) => write!(f, "Cannot access local storage: {}", e),
            SyncError::PullCollection { collection, reason } => {
                write!(f, "Pull failed for {}: {}", collection, reason)
            }
            SyncError::WriteFailure(e) => write!(f, "Write failed: {}", e),
            SyncError::ReplayExhausted { entry_id, attempts, last_error } => write!(
                f,
                "Replay exhausted for outbox entry {} after {} attempts: {}",
                entry_id, attempts, last_error
            ),
            SyncError::ChannelDropped(e) => write!(f, "Push channel dropped: {}", e),
            SyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            SyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            SyncError::Database(e) => write!(f, "Database error: {}", e),
            SyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            SyncError::IO(e) => write!(f, "IO error: {}", e),
            SyncError::Network(e) => write!(f, "Network error: {}", e),
            SyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            SyncError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            SyncError::ServerError(e) => write!(f, "Server error: {}", e),
            SyncError::InvalidData(e) => write!(f, "Invalid data: {}", e),
            SyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            SyncError::Config(e) => write!(f, "Config error: {}", e),
            SyncError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            SyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::SqliteError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(error: rusqlite::Error) -> Self {
        SyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SyncError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else if error.is_decode() {
            SyncError::InvalidData(error.to_string())
        } else {
            SyncError::Network(error.to_string())
        }
    }
}

impl SyncError {
    /// 连接层面的失败（无网络 / 超时 / 推送断开），用于判断是否应切换到离线路径
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::ChannelDropped(_)
        )
    }

    /// HTTP 状态码（如果这是一个 HTTP 错误）
    pub fn http_status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn pull(collection: Collection, reason: impl fmt::Display) -> Self {
        SyncError::PullCollection {
            collection,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
