//! 同步引擎配置
//!
//! 所有配置均可序列化，宿主可以从自己的配置文件反序列化后交给 [`SyncEngine::initialize`](crate::SyncEngine::initialize)。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::storage::StorePlatform;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒），用于直接写与 outbox 重放
    pub request_timeout_secs: Option<u64>,
    /// 附加在每个请求上的 User-Agent
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
            user_agent: None,
        }
    }
}

/// 全量拉取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// 单个集合请求超时（秒），超时记为该集合失败
    pub request_timeout_secs: u64,
    /// 并发拉取的集合数（结果仍按固定顺序提交）
    pub concurrency: usize,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            concurrency: 1,
        }
    }
}

impl PullConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// outbox 重放重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数，耗尽后条目转为「需人工处理」
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 抖动比例（0.0 - 1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        }
    }
}

/// 实时推送通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket 地址（ws:// 或 wss://）
    pub ws_url: Option<String>,
    /// 长轮询回退地址（http:// 或 https://）
    pub poll_url: Option<String>,
    /// 首次重连间隔（毫秒）
    pub reconnect_initial_ms: u64,
    /// 重连间隔上限（毫秒）
    pub reconnect_max_ms: u64,
    /// 重连退避倍数
    pub reconnect_multiplier: f64,
    /// 最大连续重连次数，超过后停在 Disconnected 直到显式重启
    pub max_reconnect_attempts: u32,
    /// 内部消息通道容量
    pub message_buffer: usize,
    /// 长轮询单次等待（秒）
    pub poll_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            poll_url: None,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 5000,
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: 10,
            message_buffer: 256,
            poll_timeout_secs: 25,
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 本地副本数据目录
    pub data_dir: PathBuf,
    /// REST API 基础地址，例如 https://api.binarjoin.app
    pub api_base_url: String,
    /// Bearer token（token 的存储由宿主负责）
    pub auth_token: Option<String>,
    /// 存储后端选择，Auto 按编译目标探测
    pub platform: StorePlatform,
    pub http_client_config: HttpClientConfig,
    pub pull_config: PullConfig,
    pub retry_config: RetryConfig,
    pub realtime_config: RealtimeConfig,
    /// 在线时自动重放 outbox 的间隔（秒），0 表示关闭
    pub replay_interval_secs: u64,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 调试模式（初始化时安装 tracing 订阅者）
    pub debug_mode: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: "http://localhost:5000".to_string(),
            auth_token: None,
            platform: StorePlatform::Auto,
            http_client_config: HttpClientConfig::default(),
            pull_config: PullConfig::default(),
            retry_config: RetryConfig::default(),
            realtime_config: RealtimeConfig::default(),
            replay_interval_secs: 30,
            event_buffer_size: 1000,
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.binarjoin/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".binarjoin")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".binarjoin")
    } else {
        PathBuf::from("./binarjoin_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 校验配置，初始化前调用
    pub fn validate(&self) -> Result<()> {
        let base = self.api_base_url.trim();
        if base.is_empty() {
            return Err(SyncError::Config("api_base_url 不能为空".to_string()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "api_base_url 必须以 http:// 或 https:// 开头: {}",
                base
            )));
        }
        if self.pull_config.concurrency == 0 {
            return Err(SyncError::Config("pull_config.concurrency 必须大于 0".to_string()));
        }
        if self.realtime_config.message_buffer == 0 {
            return Err(SyncError::Config("realtime_config.message_buffer 必须大于 0".to_string()));
        }
        if let Some(ws) = &self.realtime_config.ws_url {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                return Err(SyncError::Config(format!("ws_url 必须以 ws:// 或 wss:// 开头: {}", ws)));
            }
        }
        Ok(())
    }
}

/// 同步引擎配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn platform(mut self, platform: StorePlatform) -> Self {
        self.config.platform = platform;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn pull_timeout(mut self, timeout: Duration) -> Self {
        self.config.pull_config.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn pull_concurrency(mut self, concurrency: usize) -> Self {
        self.config.pull_config.concurrency = concurrency;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry_config = config;
        self
    }

    /// 设置推送地址；ws:// / wss:// 作为 WebSocket，http(s):// 作为长轮询回退
    pub fn push_url<S: Into<String>>(mut self, url: S) -> Self {
        let url = url.into();
        if url.starts_with("ws://") || url.starts_with("wss://") {
            self.config.realtime_config.ws_url = Some(url);
        } else {
            self.config.realtime_config.poll_url = Some(url);
        }
        self
    }

    pub fn realtime_config(mut self, config: RealtimeConfig) -> Self {
        self.config.realtime_config = config;
        self
    }

    pub fn replay_interval(mut self, interval: Duration) -> Self {
        self.config.replay_interval_secs = interval.as_secs();
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.config.debug_mode = debug;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
