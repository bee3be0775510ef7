//! 实时失效桥接（Realtime Invalidation Bridge）
//!
//! 订阅服务端推送通道，把变更通知转换为界面缓存失效：
//! - `INVALIDATE{entity, id}` → 精确失效 `[entity, id]`
//! - `INVALIDATE{entity}` / `UPDATE_ALL{entity}` → 前缀失效 `[entity]`
//!
//! 桥接层从不主动拉数据，重新获取由缓存自己完成。
//!
//! 连接状态：`Disconnected → Connecting → Connected → Disconnected`。断线后按有界指数退避
//! 自动重连，次数耗尽后停在 `Disconnected`，直到再次调用 `start()`。
//! 传输按顺序尝试（WebSocket 优先，长轮询回退）。消息经有界 mpsc 通道进入单个处理任务，按到达顺序处理。

pub mod backoff;
pub mod message;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::QueryCache;
use crate::config::RealtimeConfig;
use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventManager, SyncEvent};

pub use backoff::ReconnectBackoff;
pub use message::{parse_message, InvalidationMessage, MessageParseError};
pub use transport::{PollingTransport, PushConnection, PushTransport, WebSocketTransport};

/// 推送通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeState::Disconnected => write!(f, "未连接"),
            BridgeState::Connecting => write!(f, "连接中"),
            BridgeState::Connected => write!(f, "已连接"),
        }
    }
}

/// 桥接统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub connects: u64,
    pub messages_processed: u64,
    pub messages_skipped: u64,
    pub queries_invalidated: u64,
}

struct BridgeShared {
    state: RwLock<BridgeState>,
    events: Arc<EventManager>,
    cache: Arc<dyn QueryCache>,
    connects: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    invalidated: AtomicU64,
}

impl BridgeShared {
    async fn set_state(&self, new_state: BridgeState) {
        let old_state = {
            let mut state = self.state.write();
            if *state == new_state {
                return;
            }
            std::mem::replace(&mut *state, new_state)
        };
        debug!("📡 推送通道: {} → {}", old_state, new_state);
        self.events
            .emit(SyncEvent::BridgeStateChanged {
                old_state,
                new_state,
                timestamp: now_millis(),
            })
            .await;
    }

    async fn handle_raw(&self, raw: &str) {
        let message = match parse_message(raw) {
            Ok(message) => message,
            Err(MessageParseError::UnknownType(kind)) => {
                debug!("忽略未知推送消息类型: {}", kind);
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!("⚠️ 推送消息无法解析，已跳过: {}", e);
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let (key, exact) = message.cache_key();
        let affected = self.cache.invalidate(&key, exact).await;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.invalidated.fetch_add(affected as u64, Ordering::Relaxed);
        debug!("🧹 推送失效 {:?} (exact={}) → {} 个查询", key, exact, affected);
        self.events
            .emit(SyncEvent::CacheInvalidated {
                key,
                exact,
                timestamp: now_millis(),
            })
            .await;
    }
}

struct RunningBridge {
    cancel: CancellationToken,
    connection_task: JoinHandle<()>,
    processor_task: JoinHandle<()>,
}

pub struct RealtimeBridge {
    transports: Vec<Arc<dyn PushTransport>>,
    config: RealtimeConfig,
    shared: Arc<BridgeShared>,
    running: Mutex<Option<RunningBridge>>,
}

impl RealtimeBridge {
    pub fn new(
        transports: Vec<Arc<dyn PushTransport>>,
        config: RealtimeConfig,
        cache: Arc<dyn QueryCache>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            transports,
            config,
            shared: Arc::new(BridgeShared {
                state: RwLock::new(BridgeState::Disconnected),
                events,
                cache,
                connects: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                invalidated: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// 按配置组装传输：`ws_url` 在前，`poll_url` 作为回退
    pub fn from_config(
        config: RealtimeConfig,
        auth_token: Option<String>,
        cache: Arc<dyn QueryCache>,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let mut transports: Vec<Arc<dyn PushTransport>> = Vec::new();
        if let Some(url) = &config.ws_url {
            transports.push(Arc::new(WebSocketTransport::new(url.clone(), auth_token.clone())));
        }
        if let Some(url) = &config.poll_url {
            transports.push(Arc::new(PollingTransport::new(
                url.clone(),
                auth_token,
                Duration::from_secs(config.poll_timeout_secs),
            )?));
        }
        Ok(Self::new(transports, config, cache, events))
    }

    pub fn state(&self) -> BridgeState {
        *self.shared.state.read()
    }

    /// 连接循环是否仍在运行（重连耗尽后为 false）
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.connection_task.is_finished())
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            connects: self.shared.connects.load(Ordering::Relaxed),
            messages_processed: self.shared.processed.load(Ordering::Relaxed),
            messages_skipped: self.shared.skipped.load(Ordering::Relaxed),
            queries_invalidated: self.shared.invalidated.load(Ordering::Relaxed),
        }
    }

    /// 启动推送订阅；已在运行时直接返回
    pub async fn start(&self) -> Result<()> {
        if self.transports.is_empty() {
            return Err(SyncError::Config("未配置推送地址（ws_url / poll_url）".to_string()));
        }
        if self.is_running() {
            debug!("推送桥接已在运行");
            return Ok(());
        }
        // 上一轮重连耗尽的任务在这里回收
        self.stop().await;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.message_buffer.max(1));

        let processor_task = tokio::spawn(run_processor(self.shared.clone(), rx));
        let connection_task = tokio::spawn(run_connection_loop(
            self.shared.clone(),
            self.transports.clone(),
            ReconnectBackoff::new(&self.config),
            tx,
            cancel.clone(),
        ));

        *self.running.lock() = Some(RunningBridge {
            cancel,
            connection_task,
            processor_task,
        });
        info!("🚀 推送桥接已启动（{} 个传输）", self.transports.len());
        Ok(())
    }

    /// 停止订阅：取消连接和待执行的重连，等待后台任务退出
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.connection_task.await {
            error!("❌ 推送连接任务异常退出: {}", e);
        }
        // 发送端随连接任务一起释放，处理任务排空后自行结束
        if let Err(e) = running.processor_task.await {
            error!("❌ 推送处理任务异常退出: {}", e);
        }
        self.shared.set_state(BridgeState::Disconnected).await;
        info!("🛑 推送桥接已停止");
    }
}

impl Drop for RealtimeBridge {
    /// 未调用 `stop()` 就释放时，连接和待执行的重连随之终止
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            running.connection_task.abort();
            running.processor_task.abort();
            *self.shared.state.write() = BridgeState::Disconnected;
            debug!("推送桥接随所有者释放");
        }
    }
}

async fn run_processor(shared: Arc<BridgeShared>, mut rx: mpsc::Receiver<String>) {
    while let Some(raw) = rx.recv().await {
        shared.handle_raw(&raw).await;
    }
    debug!("推送处理任务结束");
}

/// 依次尝试每个传输，返回第一个成功的连接
async fn connect_any(
    transports: &[Arc<dyn PushTransport>],
) -> Result<(Box<dyn PushConnection>, &'static str)> {
    let mut last_error = SyncError::ChannelDropped("没有可用的推送传输".to_string());
    for transport in transports {
        match transport.connect().await {
            Ok(connection) => return Ok((connection, transport.name())),
            Err(e) => {
                warn!("⚠️ {} 连接失败: {}", transport.name(), e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

async fn run_connection_loop(
    shared: Arc<BridgeShared>,
    transports: Vec<Arc<dyn PushTransport>>,
    backoff: ReconnectBackoff,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        shared.set_state(BridgeState::Connecting).await;
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_any(&transports) => result,
        };

        match connected {
            Ok((mut connection, name)) => {
                backoff.mark_success();
                shared.connects.fetch_add(1, Ordering::Relaxed);
                shared.set_state(BridgeState::Connected).await;
                info!("✅ 推送通道已连接 ({})", name);

                let keep_going = pump_messages(connection.as_mut(), &tx, &cancel).await;
                connection.close().await;
                shared.set_state(BridgeState::Disconnected).await;
                if !keep_going {
                    break;
                }
            }
            Err(e) => {
                warn!("⚠️ 推送通道连接失败: {}", e);
                shared.set_state(BridgeState::Disconnected).await;
            }
        }

        let Some(delay) = backoff.next_delay() else {
            warn!("📴 推送通道重连次数耗尽，保持断开直到重新启动");
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.set_state(BridgeState::Disconnected).await;
    debug!("推送连接任务结束");
}

/// 转发连接上的消息；返回 false 表示应停止（已取消或处理端已关闭）
async fn pump_messages(
    connection: &mut dyn PushConnection,
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return false,
            next = connection.next_message() => next,
        };
        match next {
            Ok(Some(raw)) => {
                if tx.send(raw).await.is_err() {
                    return false;
                }
            }
            Ok(None) => {
                info!("🔌 推送通道被对端关闭");
                return true;
            }
            Err(e) => {
                warn!("⚠️ 推送通道断开: {}", e);
                return true;
            }
        }
    }
}
