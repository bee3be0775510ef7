//! 界面读缓存边界
//!
//! 引擎只通过 [`QueryCache`] 通知缓存「哪些查询过期了」，真正的重新获取由缓存自己完成。
//! 查询 key 是字符串数组，例如 `["/api/workers"]`、`["workers", "w1"]`。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::debug;

/// 查询 key 谓词
pub type KeyPredicate = dyn Fn(&[String]) -> bool + Send + Sync;

#[async_trait::async_trait]
pub trait QueryCache: Send + Sync {
    /// 标记过期；`exact = false` 时按前缀匹配（逐元素比较）。返回受影响的查询数
    async fn invalidate(&self, pattern: &[String], exact: bool) -> usize;

    /// 标记所有满足谓词的查询过期
    async fn invalidate_where(&self, predicate: &KeyPredicate) -> usize;

    /// 取消进行中的请求，避免旧范围的数据晚到覆盖新范围
    async fn cancel_in_flight(&self);

    /// 让缓存重新获取当前活跃且已过期的查询
    async fn refetch_active(&self);
}

/// `pattern` 是否匹配 `key`
pub fn key_matches(key: &[String], pattern: &[String], exact: bool) -> bool {
    if exact {
        key == pattern
    } else {
        key.len() >= pattern.len() && key.iter().zip(pattern).all(|(a, b)| a == b)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedQuery {
    pub stale: bool,
    /// 当前有界面在使用
    pub active: bool,
    pub in_flight: bool,
    pub fetch_count: u32,
}

/// 进程内缓存实现，宿主没有自己的缓存层时使用
#[derive(Debug, Default)]
pub struct MemoryQueryCache {
    entries: RwLock<HashMap<Vec<String>, CachedQuery>>,
    cancelled: AtomicUsize,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个查询（界面挂载时调用）
    pub fn register(&self, key: Vec<String>, active: bool) {
        self.entries.write().entry(key).or_default().active = active;
    }

    pub fn set_in_flight(&self, key: &[String], in_flight: bool) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.in_flight = in_flight;
        }
    }

    pub fn get(&self, key: &[String]) -> Option<CachedQuery> {
        self.entries.read().get(key).cloned()
    }

    pub fn is_stale(&self, key: &[String]) -> bool {
        self.get(key).is_some_and(|q| q.stale)
    }

    /// 累计被取消的请求数
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn mark_stale<F>(&self, matches: F) -> usize
    where
        F: Fn(&[String]) -> bool,
    {
        let mut entries = self.entries.write();
        let mut affected = 0;
        for (key, entry) in entries.iter_mut() {
            if matches(key) {
                entry.stale = true;
                affected += 1;
            }
        }
        affected
    }
}

#[async_trait::async_trait]
impl QueryCache for MemoryQueryCache {
    async fn invalidate(&self, pattern: &[String], exact: bool) -> usize {
        let affected = self.mark_stale(|key| key_matches(key, pattern, exact));
        debug!("🧹 invalidate {:?} (exact={}) → {} 个查询", pattern, exact, affected);
        affected
    }

    async fn invalidate_where(&self, predicate: &KeyPredicate) -> usize {
        self.mark_stale(predicate)
    }

    async fn cancel_in_flight(&self) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut().filter(|e| e.in_flight) {
            entry.in_flight = false;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn refetch_active(&self) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut().filter(|e| e.active && e.stale) {
            entry.stale = false;
            entry.fetch_count += 1;
        }
    }
}
