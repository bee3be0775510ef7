//! 生命周期管理
//!
//! 管理 App 前后台切换，统一触发各模块的状态切换。回到前台时重放 outbox。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sync::outbox::OutboxQueue;
use crate::sync::state::SyncStateManager;

/// 生命周期回调 Hook
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败时记录错误并继续，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到后台");
        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到前台");
        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 回到前台时重放 outbox（离线时跳过）
pub struct OutboxReplayHook {
    outbox: Arc<OutboxQueue>,
    state: SyncStateManager,
}

impl OutboxReplayHook {
    pub fn new(outbox: Arc<OutboxQueue>, state: SyncStateManager) -> Self {
        Self { outbox, state }
    }
}

#[async_trait]
impl LifecycleHook for OutboxReplayHook {
    async fn on_background(&self) -> Result<()> {
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        if !self.state.is_online() {
            debug!("📴 离线状态，前台切换不重放 outbox");
            return Ok(());
        }
        let report = self.outbox.replay().await?;
        if report.attempted > 0 {
            info!("📤 前台切换重放 outbox: 成功 {} / 尝试 {}", report.succeeded, report.attempted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::events::EventManager;
    use crate::sync::outbox::OutboxOperation;
    use crate::sync::retry_policy::RetryPolicy;
    use crate::test_support::{kv_store, MockRemoteApi};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingHook {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncError::InvalidData("boom".into()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.on_background().await
        }
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let failing = Arc::new(CountingHook { calls: AtomicUsize::new(0), fail: true });
        let ok = Arc::new(CountingHook { calls: AtomicUsize::new(0), fail: false });
        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(ok.clone());
        assert_eq!(manager.hook_count(), 2);

        assert!(manager.notify_background().await.is_err());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_foreground_replays_outbox_when_online() {
        let temp_dir = TempDir::new().unwrap();
        let store = kv_store(temp_dir.path()).await;
        let api = MockRemoteApi::new();
        let state = SyncStateManager::new();
        let outbox = Arc::new(
            OutboxQueue::open(store, api.clone(), state.clone(), Arc::new(EventManager::new(16)), RetryPolicy::default())
                .await
                .unwrap(),
        );
        outbox
            .queue_for_sync(OutboxOperation::Create, "/api/wells", json!({"id": "well-1"}))
            .await
            .unwrap();

        let mut manager = LifecycleManager::new();
        manager.register_hook(Arc::new(OutboxReplayHook::new(outbox.clone(), state.clone())));

        state.set_online(false);
        manager.notify_foreground().await.unwrap();
        assert!(api.write_log().is_empty());

        state.set_online(true);
        manager.notify_foreground().await.unwrap();
        assert_eq!(api.write_log().len(), 1);
        assert!(outbox.is_empty().await.unwrap());
    }
}
