//! 事件系统模块 - 同步引擎对外广播的通知
//!
//! 功能包括：
//! - 全量拉取开始 / 单集合结果 / 拉取完成
//! - outbox 入队（「已保存到本地，稍后同步」）、重放成功、重放失败、需人工处理
//! - 推送通道状态变更与缓存失效
//! - 项目范围切换与网络状态变更
//!
//! Sync State 本身有独立的订阅接口（见 [`crate::sync::state`]），这里的事件面向日志、提示条等旁路消费者。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::collections::Collection;
use crate::realtime::BridgeState;
use crate::scope::ProjectScope;
use crate::sync::outbox::OutboxOperation;

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// 同步引擎事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    PullStarted {
        total: usize,
        timestamp: u64,
    },
    CollectionPulled {
        collection: Collection,
        record_count: usize,
        timestamp: u64,
    },
    CollectionPullFailed {
        collection: Collection,
        error: String,
        timestamp: u64,
    },
    PullCompleted {
        synced_count: usize,
        failed_count: usize,
        timestamp: u64,
    },
    /// 直接写失败，已保存到本地 outbox
    WriteQueued {
        entry_id: String,
        operation: OutboxOperation,
        endpoint: String,
        timestamp: u64,
    },
    EntryReplayed {
        entry_id: String,
        endpoint: String,
        timestamp: u64,
    },
    ReplayFailed {
        entry_id: String,
        endpoint: String,
        attempts: u32,
        error: String,
        timestamp: u64,
    },
    /// 重试耗尽或服务端拒绝，条目保留等待人工处理
    AttentionRequired {
        entry_id: String,
        endpoint: String,
        attempts: u32,
        error: String,
        timestamp: u64,
    },
    BridgeStateChanged {
        old_state: BridgeState,
        new_state: BridgeState,
        timestamp: u64,
    },
    CacheInvalidated {
        key: Vec<String>,
        exact: bool,
        timestamp: u64,
    },
    ScopeChanged {
        scope: ProjectScope,
        timestamp: u64,
    },
    NetworkChanged {
        online: bool,
        timestamp: u64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::PullStarted { .. } => "pull_started",
            SyncEvent::CollectionPulled { .. } => "collection_pulled",
            SyncEvent::CollectionPullFailed { .. } => "collection_pull_failed",
            SyncEvent::PullCompleted { .. } => "pull_completed",
            SyncEvent::WriteQueued { .. } => "write_queued",
            SyncEvent::EntryReplayed { .. } => "entry_replayed",
            SyncEvent::ReplayFailed { .. } => "replay_failed",
            SyncEvent::AttentionRequired { .. } => "attention_required",
            SyncEvent::BridgeStateChanged { .. } => "bridge_state_changed",
            SyncEvent::CacheInvalidated { .. } => "cache_invalidated",
            SyncEvent::ScopeChanged { .. } => "scope_changed",
            SyncEvent::NetworkChanged { .. } => "network_changed",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::PullStarted { timestamp, .. }
            | SyncEvent::CollectionPulled { timestamp, .. }
            | SyncEvent::CollectionPullFailed { timestamp, .. }
            | SyncEvent::PullCompleted { timestamp, .. }
            | SyncEvent::WriteQueued { timestamp, .. }
            | SyncEvent::EntryReplayed { timestamp, .. }
            | SyncEvent::ReplayFailed { timestamp, .. }
            | SyncEvent::AttentionRequired { timestamp, .. }
            | SyncEvent::BridgeStateChanged { timestamp, .. }
            | SyncEvent::CacheInvalidated { timestamp, .. }
            | SyncEvent::ScopeChanged { timestamp, .. }
            | SyncEvent::NetworkChanged { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的集合（如果有）
    pub fn collection(&self) -> Option<Collection> {
        match self {
            SyncEvent::CollectionPulled { collection, .. }
            | SyncEvent::CollectionPullFailed { collection, .. } => Some(*collection),
            SyncEvent::WriteQueued { endpoint, .. }
            | SyncEvent::EntryReplayed { endpoint, .. }
            | SyncEvent::ReplayFailed { endpoint, .. }
            | SyncEvent::AttentionRequired { endpoint, .. } => Collection::from_endpoint(endpoint),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub collections: Option<Vec<Collection>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_collections(mut self, collections: Vec<Collection>) -> Self {
        self.collections = Some(collections);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ref collections) = self.collections {
            match event.collection() {
                Some(c) if collections.contains(&c) => {}
                _ => return false,
            }
        }
        true
    }
}

pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// 按事件类型注册的监听器，"*" 表示全部
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<u64>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 失败属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pulled(collection: Collection) -> SyncEvent {
        SyncEvent::CollectionPulled {
            collection,
            record_count: 3,
            timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);
        let mut receiver = manager.subscribe();

        manager.emit(pulled(Collection::Workers)).await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "collection_pulled");

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("collection_pulled"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter_by_collection() {
        let manager = EventManager::new(100);
        let filter = EventFilter::new().with_collections(vec![Collection::FundTransfers]);
        let mut filtered = manager.subscribe_filtered(filter);

        manager.emit(pulled(Collection::Workers)).await;
        manager
            .emit(SyncEvent::WriteQueued {
                entry_id: "e1".into(),
                operation: OutboxOperation::Create,
                endpoint: "/api/fund-transfers".into(),
                timestamp: now_millis(),
            })
            .await;

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.event_type(), "write_queued");
        assert!(filtered.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_listeners() {
        let manager = EventManager::new(100);
        let typed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let typed_clone = typed.clone();
        manager
            .add_listener("network_changed", move |_| {
                typed_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let all_clone = all.clone();
        manager
            .add_listener("*", move |_| {
                all_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        manager
            .emit(SyncEvent::NetworkChanged { online: true, timestamp: now_millis() })
            .await;
        manager.emit(pulled(Collection::Projects)).await;

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get_stats().await.listener_count, 2);

        manager.clear_listeners().await;
        assert_eq!(manager.get_stats().await.listener_count, 0);
    }
}
