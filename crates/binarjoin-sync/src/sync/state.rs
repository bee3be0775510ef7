//! 同步状态 - 可观察的进程级状态服务
//!
//! - `get_sync_state()` 同步返回最近一次提交的快照，不等待任何进行中的工作
//! - `subscribe_sync_state()` 订阅时立即回调当前快照，之后每次状态迁移都回调
//! - 状态迁移与投递在同一把迁移锁内完成，订阅者看到的顺序与产生顺序一致
//!
//! 修改接口只对 crate 内开放：拉取相关字段由全量拉取编排器修改，
//! `is_online` 由网络监听修改，`pending_count` 由 outbox 修改。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 拉取进度
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// 当前集合序号（从 1 开始；0 表示尚未开始第一个集合）
    pub current: usize,
    pub total: usize,
    pub table_name: String,
    /// floor(current / total * 100)
    pub percentage: u8,
}

impl SyncProgress {
    pub fn new(current: usize, total: usize, table_name: impl Into<String>) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            (current.min(total) * 100 / total) as u8
        };
        Self {
            current,
            total,
            table_name: table_name.into(),
            percentage,
        }
    }
}

/// 同步状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub is_syncing: bool,
    /// 仅在 is_syncing 时为 Some
    pub progress: Option<SyncProgress>,
    pub is_online: bool,
    /// 上次拉取完成时间（毫秒时间戳），0 表示从未同步
    pub last_sync: i64,
    pub synced_count: usize,
    pub failed_count: usize,
    pub last_error: Option<String>,
    /// outbox 中待同步的条目数
    pub pending_count: usize,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            is_syncing: false,
            progress: None,
            is_online: true,
            last_sync: 0,
            synced_count: 0,
            failed_count: 0,
            last_error: None,
            pending_count: 0,
        }
    }
}

impl SyncSnapshot {
    /// 供诊断页展示的一行摘要
    pub fn summary(&self) -> String {
        if let Some(p) = &self.progress {
            return format!("正在同步 {} ({}/{}, {}%)", p.table_name, p.current, p.total, p.percentage);
        }
        if self.failed_count > 0 {
            format!("已同步 {} 个集合，{} 个失败", self.synced_count, self.failed_count)
        } else if self.last_sync > 0 {
            format!("已同步 {} 个集合", self.synced_count)
        } else {
            "尚未同步".to_string()
        }
    }
}

type Callback = Arc<dyn Fn(&SyncSnapshot) + Send + Sync>;

struct Inner {
    snapshot: RwLock<SyncSnapshot>,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    /// 串行化「修改 + 投递」；可重入，回调里再订阅不会死锁
    transition: ReentrantMutex<()>,
}

/// 同步状态服务，克隆后共享同一份状态
#[derive(Clone)]
pub struct SyncStateManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStateManager")
            .field("snapshot", &*self.inner.snapshot.read())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for SyncStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateManager {
    pub fn new() -> Self {
        Self::with_snapshot(SyncSnapshot::default())
    }

    pub fn with_snapshot(snapshot: SyncSnapshot) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot: RwLock::new(snapshot),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                transition: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn get_sync_state(&self) -> SyncSnapshot {
        self.inner.snapshot.read().clone()
    }

    /// 订阅状态变化，立即以当前快照回调一次
    pub fn subscribe_sync_state<F>(&self, callback: F) -> SyncStateSubscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        let _guard = self.inner.transition.lock();
        let callback: Callback = Arc::new(callback);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, callback.clone()));

        let snapshot = self.get_sync_state();
        callback(&snapshot);

        SyncStateSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// 执行一次状态迁移并按序投递；返回迁移后的快照
    fn transition<F>(&self, mutate: F) -> SyncSnapshot
    where
        F: FnOnce(&mut SyncSnapshot),
    {
        let _guard = self.inner.transition.lock();
        let snapshot = {
            let mut current = self.inner.snapshot.write();
            mutate(&mut current);
            current.clone()
        };
        let callbacks: Vec<Callback> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(&snapshot);
        }
        snapshot
    }

    /// 开始一次拉取；已在同步中则返回 false
    pub(crate) fn begin_pull(&self, total: usize) -> bool {
        let _guard = self.inner.transition.lock();
        if self.inner.snapshot.read().is_syncing {
            return false;
        }
        self.transition(|s| {
            s.is_syncing = true;
            s.progress = Some(SyncProgress::new(0, total, ""));
            s.synced_count = 0;
            s.failed_count = 0;
            s.last_error = None;
        });
        true
    }

    /// 更新进度；`current` 只增不减，落后的更新被忽略
    pub(crate) fn set_progress(&self, current: usize, total: usize, table_name: &str) {
        self.transition(|s| {
            let ahead = s.progress.as_ref().map_or(true, |p| current > p.current);
            if s.is_syncing && ahead {
                s.progress = Some(SyncProgress::new(current, total, table_name));
            }
        });
    }

    pub(crate) fn record_success(&self) {
        self.transition(|s| s.synced_count += 1);
    }

    pub(crate) fn record_failure(&self, error: String) {
        self.transition(|s| {
            s.failed_count += 1;
            s.last_error = Some(error);
        });
    }

    pub(crate) fn finish_pull(&self) -> SyncSnapshot {
        self.transition(|s| {
            s.is_syncing = false;
            s.progress = None;
            s.last_sync = chrono::Utc::now().timestamp_millis();
        })
    }

    /// 设置在线状态；未变化时不产生迁移
    pub(crate) fn set_online(&self, online: bool) {
        let _guard = self.inner.transition.lock();
        if self.inner.snapshot.read().is_online == online {
            return;
        }
        debug!("🌐 同步状态在线标记: {}", online);
        self.transition(|s| s.is_online = online);
    }

    pub(crate) fn set_pending_count(&self, pending: usize) {
        let _guard = self.inner.transition.lock();
        if self.inner.snapshot.read().pending_count == pending {
            return;
        }
        self.transition(|s| s.pending_count = pending);
    }

    pub fn is_online(&self) -> bool {
        self.inner.snapshot.read().is_online
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.snapshot.read().is_syncing
    }
}

/// 订阅句柄；调用 `unsubscribe` 后不再收到回调（丢弃句柄不会自动退订）
#[derive(Debug)]
pub struct SyncStateSubscription {
    id: u64,
    inner: Weak<Inner>,
}

impl SyncStateSubscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            // 与迁移互斥：退订返回后不会再有投递
            let _guard = inner.transition.lock();
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.subscribers.lock().iter().any(|(id, _)| *id == self.id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(manager: &SyncStateManager) -> (Arc<Mutex<Vec<SyncSnapshot>>>, SyncStateSubscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sub = manager.subscribe_sync_state(move |s| seen_clone.lock().push(s.clone()));
        (seen, sub)
    }

    #[test]
    fn test_progress_percentage_is_floored() {
        assert_eq!(SyncProgress::new(1, 3, "workers").percentage, 33);
        assert_eq!(SyncProgress::new(2, 3, "workers").percentage, 66);
        assert_eq!(SyncProgress::new(3, 3, "workers").percentage, 100);
        assert_eq!(SyncProgress::new(0, 0, "").percentage, 0);
    }

    #[test]
    fn test_subscribe_delivers_initial_snapshot() {
        let manager = SyncStateManager::new();
        manager.record_failure("x".into());

        let (seen, _sub) = recorder(&manager);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].failed_count, 1);
    }

    #[test]
    fn test_pull_lifecycle_keeps_progress_invariant() {
        let manager = SyncStateManager::new();
        let (seen, _sub) = recorder(&manager);

        assert!(manager.begin_pull(2));
        assert!(!manager.begin_pull(2));
        manager.set_progress(1, 2, "projects");
        manager.record_success();
        manager.set_progress(2, 2, "workers");
        manager.record_failure("workers: timeout".into());
        let final_state = manager.finish_pull();

        assert!(!final_state.is_syncing);
        assert!(final_state.progress.is_none());
        assert!(final_state.last_sync > 0);
        assert_eq!(final_state.last_error.as_deref(), Some("workers: timeout"));

        let seen = seen.lock();
        for s in seen.iter() {
            assert_eq!(s.progress.is_some(), s.is_syncing);
        }
        let totals: Vec<_> = seen[1..].iter().map(|s| s.synced_count + s.failed_count).collect();
        assert!(totals.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().unwrap(), &final_state);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let manager = SyncStateManager::new();
        let (seen, sub) = recorder(&manager);
        assert!(sub.is_active());

        manager.set_pending_count(3);
        sub.unsubscribe();
        assert!(!sub.is_active());
        manager.set_pending_count(4);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[test]
    fn test_no_op_setters_do_not_notify() {
        let manager = SyncStateManager::new();
        let (seen, _sub) = recorder(&manager);
        manager.set_online(true);
        manager.set_pending_count(0);
        assert_eq!(seen.lock().len(), 1);
        manager.set_online(false);
        assert!(!manager.is_online());
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = SyncStateManager::new();
        let b = SyncStateManager::new();
        a.record_success();
        assert_eq!(a.get_sync_state().synced_count, 1);
        assert_eq!(b.get_sync_state().synced_count, 0);
    }

    #[test]
    fn test_subscribe_from_callback_does_not_deadlock() {
        let manager = SyncStateManager::new();
        let nested = Arc::new(Mutex::new(None));
        let manager_clone = manager.clone();
        let nested_clone = nested.clone();
        let _sub = manager.subscribe_sync_state(move |_| {
            let mut slot = nested_clone.lock();
            if slot.is_none() {
                *slot = Some(manager_clone.subscribe_sync_state(|_| {}));
            }
        });
        assert_eq!(manager.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_transitions_are_delivered_in_order() {
        let manager = SyncStateManager::new();
        let (seen, _sub) = recorder(&manager);
        manager.begin_pull(100);

        let mut handles = Vec::new();
        for i in 0..8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    if i % 2 == 0 {
                        m.record_success();
                    } else {
                        m.record_failure("boom".into());
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        manager.finish_pull();

        let seen = seen.lock();
        let totals: Vec<_> = seen.iter().map(|s| s.synced_count + s.failed_count).collect();
        assert!(totals[1..].windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*totals.last().unwrap(), 200);
    }
}
