//! 同步引擎门面
//!
//! 按层组装各组件：副本存储 → 远端 API → 同步状态 / 事件 → outbox → 全量拉取 → 推送桥接 → 范围刷新。
//! 宿主只需持有一个 `Arc<SyncEngine>`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::QueryCache;
use crate::collections::Collection;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::http_client::{ApiClient, RemoteApi};
use crate::lifecycle::{LifecycleManager, OutboxReplayHook};
use crate::logging::init_logging;
use crate::maintenance::{CleanupPolicy, CleanupReport, ReplicaMaintenance};
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::realtime::{BridgeState, RealtimeBridge};
use crate::scope::{ProjectScope, ScopeRefreshReport, ScopeRefresher};
use crate::storage::{LocalReplicaStore, ReplicaStore};
use crate::sync::outbox::{OutboxEntry, OutboxOperation, OutboxQueue, OutboxStats, ReplayReport};
use crate::sync::pull::{InitialPullOrchestrator, LastSyncInfo};
use crate::sync::retry_policy::{ReplayFailureReason, RetryPolicy};
use crate::sync::state::{SyncSnapshot, SyncStateManager, SyncStateSubscription};

/// 写操作结果
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// 直接写成功，携带服务端回写的记录
    Synced(Option<Value>),
    /// 直接写失败，已保存到本地，稍后同步
    SavedLocally { entry_id: String },
}

impl WriteOutcome {
    pub fn is_saved_locally(&self) -> bool {
        matches!(self, WriteOutcome::SavedLocally { .. })
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<ReplicaStore>,
    api: Arc<dyn RemoteApi>,
    state: SyncStateManager,
    events: Arc<EventManager>,
    outbox: Arc<OutboxQueue>,
    pull: Arc<InitialPullOrchestrator>,
    maintenance: ReplicaMaintenance,
    realtime: RealtimeBridge,
    scope: ScopeRefresher,
    lifecycle: tokio::sync::RwLock<LifecycleManager>,
    network: parking_lot::Mutex<Option<Arc<NetworkMonitor>>>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    shutting_down: AtomicBool,
}

impl SyncEngine {
    /// 初始化引擎
    ///
    /// `api` 为 None 时按配置创建 reqwest 客户端。本地存储打不开时返回 `StoreInit`，
    /// 这是唯一的致命错误，宿主应据此阻断依赖本地数据的界面。
    pub async fn initialize(
        config: SyncConfig,
        api: Option<Arc<dyn RemoteApi>>,
        cache: Arc<dyn QueryCache>,
    ) -> Result<Arc<Self>> {
        if config.debug_mode {
            init_logging(true);
        }
        info!("正在初始化同步引擎...");
        config.validate()?;

        // === 第1层：本地副本存储 ===
        let store = Arc::new(ReplicaStore::for_platform(config.platform, &config.data_dir));
        store.initialize().await.map_err(|e| match e {
            SyncError::StoreInit(_) => e,
            other => SyncError::StoreInit(other.to_string()),
        })?;
        info!("✅ 本地副本存储就绪 ({})", store.backend_name());

        // === 第2层：远端 API ===
        let api: Arc<dyn RemoteApi> = match api {
            Some(api) => api,
            None => Arc::new(ApiClient::new(
                &config.http_client_config,
                &config.api_base_url,
                config.auth_token.clone(),
            )?),
        };

        // === 第3层：同步状态与事件 ===
        let state = SyncStateManager::new();
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：outbox ===
        let outbox = Arc::new(
            OutboxQueue::open(
                store.clone(),
                api.clone(),
                state.clone(),
                events.clone(),
                RetryPolicy::from(config.retry_config.clone()),
            )
            .await?,
        );

        // === 第5层：全量拉取 ===
        let pull = Arc::new(InitialPullOrchestrator::new(
            store.clone(),
            api.clone(),
            state.clone(),
            events.clone(),
            config.pull_config.clone(),
        ));

        // === 第6层：推送桥接与范围刷新 ===
        let realtime = RealtimeBridge::from_config(
            config.realtime_config.clone(),
            config.auth_token.clone(),
            cache.clone(),
            events.clone(),
        )?;
        let scope = ScopeRefresher::new(cache, store.clone(), events.clone());
        let restored = scope.restore().await;
        debug!("恢复项目范围: {}", restored);

        // === 第7层：生命周期 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(OutboxReplayHook::new(outbox.clone(), state.clone())));

        let maintenance = ReplicaMaintenance::new(store.clone());

        let engine = Arc::new(Self {
            config,
            store,
            api,
            state,
            events,
            outbox,
            pull,
            maintenance,
            realtime,
            scope,
            lifecycle: tokio::sync::RwLock::new(lifecycle),
            network: parking_lot::Mutex::new(None),
            background: parking_lot::Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        });
        engine.spawn_periodic_replay();

        info!("✅ 同步引擎初始化完成");
        Ok(engine)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown("同步引擎已关闭".to_string()));
        }
        Ok(())
    }

    fn spawn_periodic_replay(&self) {
        if self.config.replay_interval_secs == 0 {
            return;
        }
        let period = Duration::from_secs(self.config.replay_interval_secs);
        let outbox = self.outbox.clone();
        let state = self.state.clone();
        let token = self.shutdown_token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !state.is_online() || state.get_sync_state().pending_count == 0 {
                    continue;
                }
                if let Err(e) = outbox.replay().await {
                    warn!("⚠️ 定时重放 outbox 失败: {}", e);
                }
            }
            debug!("定时重放任务结束");
        });
        self.background.lock().push(task);
    }

    // ========== 同步状态 ==========

    pub fn get_sync_state(&self) -> SyncSnapshot {
        self.state.get_sync_state()
    }

    pub fn subscribe_sync_state<F>(&self, callback: F) -> SyncStateSubscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        self.state.subscribe_sync_state(callback)
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.events.clone()
    }

    // ========== 全量拉取 ==========

    pub async fn perform_initial_data_pull(&self) -> bool {
        if self.ensure_running().is_err() {
            return false;
        }
        self.pull.perform_initial_data_pull().await
    }

    pub async fn last_sync_info(&self) -> Result<Option<LastSyncInfo>> {
        self.pull.last_sync_info().await
    }

    // ========== 写操作与 outbox ==========

    /// 先直接写远端，失败时保存到 outbox
    ///
    /// 任何失败都会入队，用户输入不会丢失。被服务端明确拒绝（不可重试的 4xx）的条目
    /// 在重放时转入待处理列表。
    pub async fn submit_write(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: Value,
    ) -> Result<WriteOutcome> {
        self.ensure_running()?;
        if !self.state.is_online() {
            let entry_id = self.outbox.queue_for_sync(operation, endpoint, payload).await?;
            return Ok(WriteOutcome::SavedLocally { entry_id });
        }

        match self.api.send(operation, endpoint, &payload, None).await {
            Ok(response) => {
                self.outbox
                    .apply_direct_write(operation, endpoint, payload, response.clone())
                    .await;
                Ok(WriteOutcome::Synced(response))
            }
            Err(e) => {
                if !ReplayFailureReason::from(&e).is_retryable() {
                    warn!("⚠️ 写请求被服务端拒绝，仍保存到本地等待处理 {} {}: {}", operation, endpoint, e);
                }
                let failure = SyncError::WriteFailure(e.to_string());
                info!("💾 直接写失败，转入 outbox: {} {} - {}", operation, endpoint, failure);
                let entry_id = self
                    .outbox
                    .queue_failed_write(operation, endpoint, payload, &failure)
                    .await?;
                Ok(WriteOutcome::SavedLocally { entry_id })
            }
        }
    }

    /// 直接写失败后由调用方显式入队
    pub async fn queue_for_sync(&self, operation: OutboxOperation, endpoint: &str, payload: Value) -> Result<String> {
        self.ensure_running()?;
        self.outbox.queue_for_sync(operation, endpoint, payload).await
    }

    pub async fn replay_outbox(&self) -> Result<ReplayReport> {
        self.ensure_running()?;
        self.outbox.replay().await
    }

    /// 用户点击「立即同步」：忽略退避立即重放
    pub async fn sync_now(&self) -> Result<ReplayReport> {
        self.ensure_running()?;
        self.outbox.replay_now().await
    }

    pub async fn pending_writes(&self) -> Result<Vec<OutboxEntry>> {
        self.outbox.pending().await
    }

    pub async fn attention_required(&self) -> Result<Vec<OutboxEntry>> {
        self.outbox.attention_required().await
    }

    pub async fn retry_write(&self, entry_id: &str) -> Result<bool> {
        self.outbox.retry_entry(entry_id).await
    }

    pub async fn cancel_write(&self, entry_id: &str) -> Result<bool> {
        self.outbox.cancel(entry_id).await
    }

    pub async fn cancel_all_writes(&self) -> Result<usize> {
        self.outbox.cancel_all().await
    }

    pub async fn outbox_stats(&self) -> Result<OutboxStats> {
        self.outbox.stats().await
    }

    // ========== 本地副本 ==========

    pub async fn get_records(&self, collection: Collection) -> Result<Vec<Value>> {
        self.store.get_all(collection).await
    }

    pub async fn get_record(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        self.store.get(collection, key).await
    }

    /// 诊断页：各集合记录数
    pub async fn collection_counts(&self) -> Vec<(Collection, usize)> {
        self.store.collection_counts().await
    }

    pub fn storage_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    // ========== 数据维护 ==========

    /// 清空本地副本（镜像集合与上次拉取记录）；outbox 中未同步的写操作保留
    pub async fn clear_local_data(&self) -> Result<usize> {
        self.ensure_running()?;
        self.maintenance.clear_all_local_data().await
    }

    /// 按策略清理过期记录与软删除记录
    pub async fn run_cleanup(&self, policy: &CleanupPolicy) -> Result<CleanupReport> {
        self.ensure_running()?;
        Ok(self.maintenance.run_cleanup_policy(policy).await)
    }

    pub async fn last_sync_time(&self) -> Option<i64> {
        self.maintenance.last_sync_time().await
    }

    /// 上次全量拉取是否在 `max_age` 以内
    pub async fn is_data_up_to_date(&self, max_age: Duration) -> bool {
        self.maintenance.is_data_up_to_date(max_age).await
    }

    pub async fn export_local_data(&self) -> Result<String> {
        self.maintenance.export_json().await
    }

    /// 导入备份后重新加载 outbox 与项目范围
    pub async fn import_local_data(&self, json: &str) -> Result<usize> {
        self.ensure_running()?;
        let imported = self.maintenance.import_json(json).await?;
        let pending = self.outbox.reload().await?;
        let scope = self.scope.restore().await;
        info!("📥 备份已导入: {} 条记录, 待同步 {} 条, 范围 {}", imported, pending, scope);
        Ok(imported)
    }

    // ========== 实时推送 ==========

    pub async fn start_realtime(&self) -> Result<()> {
        self.ensure_running()?;
        self.realtime.start().await
    }

    pub async fn stop_realtime(&self) {
        self.realtime.stop().await
    }

    pub fn realtime_state(&self) -> BridgeState {
        self.realtime.state()
    }

    // ========== 项目范围 ==========

    pub async fn change_scope(&self, scope: ProjectScope) -> Result<ScopeRefreshReport> {
        self.ensure_running()?;
        self.scope.change_scope(scope).await
    }

    pub fn current_scope(&self) -> ProjectScope {
        self.scope.current()
    }

    pub async fn refresh_scope(&self) -> ScopeRefreshReport {
        self.scope.refresh().await
    }

    // ========== 网络与生命周期 ==========

    /// 手动设置在线状态；离线 → 在线时先重放 outbox，再全量拉取
    pub async fn set_online(&self, online: bool) {
        handle_connectivity(&self.state, &self.events, &self.outbox, &self.pull, online).await;
    }

    /// 接入宿主平台的网络监听器
    pub async fn attach_network_listener(&self, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        self.ensure_running()?;
        let monitor = Arc::new(NetworkMonitor::new(listener));
        let mut receiver = monitor.subscribe();
        monitor.start().await?;
        // 初始状态由 start() 广播，这里直接同步一次，避免漏掉
        let reachable = monitor.check_connection().await;
        self.state.set_online(reachable);

        let state = self.state.clone();
        let events = self.events.clone();
        let outbox = self.outbox.clone();
        let pull = self.pull.clone();
        let token = self.shutdown_token.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(event) => {
                        handle_connectivity(&state, &events, &outbox, &pull, event.new_status.is_reachable()).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("⚠️ 网络事件滞后 {} 条", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.background.lock().push(task);

        if let Some(old) = self.network.lock().replace(monitor) {
            tokio::spawn(async move { old.stop().await });
        }
        Ok(())
    }

    pub async fn on_foreground(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.read().await.notify_foreground().await
    }

    pub async fn on_background(&self) -> Result<()> {
        self.lifecycle.read().await.notify_background().await
    }

    /// 关闭引擎：停止推送、网络监控和后台任务。outbox 条目保留在本地
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭同步引擎...");
        self.shutdown_token.cancel();
        self.realtime.stop().await;

        let monitor = self.network.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        let tasks: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("❌ 后台任务异常退出: {}", e);
            }
        }
        info!("同步引擎关闭完成");
        Ok(())
    }
}

impl Drop for SyncEngine {
    /// 未调用 `shutdown()` 就释放时，后台任务随引擎终止；推送桥接由自身的 Drop 处理
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        for task in self.background.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn handle_connectivity(
    state: &SyncStateManager,
    events: &EventManager,
    outbox: &OutboxQueue,
    pull: &InitialPullOrchestrator,
    online: bool,
) {
    let was_online = state.is_online();
    state.set_online(online);
    if was_online == online {
        return;
    }
    events
        .emit(SyncEvent::NetworkChanged {
            online,
            timestamp: now_millis(),
        })
        .await;
    if !online {
        info!("📴 网络已断开，写操作将保存到本地");
        return;
    }

    info!("🌐 网络已恢复，开始重放 outbox 并刷新本地副本");
    match outbox.replay().await {
        Ok(report) if report.attempted > 0 => {
            info!("📤 恢复联网重放: 成功 {} / 尝试 {}", report.succeeded, report.attempted);
        }
        Ok(_) => {}
        Err(e) => warn!("⚠️ 恢复联网重放 outbox 失败: {}", e),
    }
    pull.perform_initial_data_pull().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryQueryCache;
    use crate::network::test_helpers::ManualNetworkListener;
    use crate::network::NetworkStatus;
    use crate::storage::StorePlatform;
    use crate::test_support::{MockFailure, MockRemoteApi};
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &std::path::Path, platform: StorePlatform) -> SyncConfig {
        SyncConfig::builder()
            .data_dir(dir)
            .platform(platform)
            .replay_interval(Duration::from_secs(0))
            .build()
    }

    async fn engine(dir: &std::path::Path, api: Arc<MockRemoteApi>) -> Arc<SyncEngine> {
        SyncEngine::initialize(config(dir, StorePlatform::Web), Some(api as Arc<dyn RemoteApi>), Arc::new(MemoryQueryCache::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_round_trip_then_pull() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        let engine = engine(temp_dir.path(), api.clone()).await;

        let outcome = engine
            .submit_write(OutboxOperation::Create, "/api/materials", json!({"id": "m1", "name": "Steel"}))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Synced(Some(_))));

        assert!(engine.perform_initial_data_pull().await);
        let materials = engine.get_records(Collection::Materials).await.unwrap();
        assert_eq!(materials.len(), 1);
        assert_eq!(materials[0]["name"], "Steel");
        assert!(engine.last_sync_info().await.unwrap().is_some());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_is_saved_locally() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        let engine = engine(temp_dir.path(), api.clone()).await;

        api.fail_next_writes([MockFailure::Timeout]);
        let outcome = engine
            .submit_write(OutboxOperation::Create, "/api/fund-transfers", json!({"amount": 10}))
            .await
            .unwrap();
        assert!(outcome.is_saved_locally());
        assert_eq!(engine.get_sync_state().pending_count, 1);
        let pending = engine.pending_writes().await.unwrap();
        assert!(pending[0].last_error.as_deref().unwrap_or_default().starts_with("Write failed"));
        assert_eq!(pending[0].retries, 0);

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(engine.get_sync_state().pending_count, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_write_is_kept_for_attention() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        let engine = engine(temp_dir.path(), api.clone()).await;

        api.fail_next_writes([MockFailure::Http(422)]);
        let outcome = engine
            .submit_write(OutboxOperation::Create, "/api/fund-transfers", json!({"amount": 5}))
            .await
            .unwrap();
        assert!(outcome.is_saved_locally());
        assert_eq!(engine.outbox_stats().await.unwrap().total, 1);

        // 重放时服务端仍然拒绝，条目转入待处理而不是被丢弃
        api.fail_next_writes([MockFailure::Http(422)]);
        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.needs_attention, 1);
        let attention = engine.attention_required().await.unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].payload["amount"], 5);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_replays_then_pulls() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        let engine = engine(temp_dir.path(), api.clone()).await;

        engine.set_online(false).await;
        let outcome = engine
            .submit_write(OutboxOperation::Create, "/api/workers", json!({"id": "w1", "name": "Ali"}))
            .await
            .unwrap();
        assert!(outcome.is_saved_locally());
        assert!(api.write_log().is_empty());
        assert!(!engine.perform_initial_data_pull().await);

        engine.set_online(true).await;
        assert_eq!(api.write_log().len(), 1);
        assert!(engine.pending_writes().await.unwrap().is_empty());
        let workers = engine.get_records(Collection::Workers).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert!(engine.get_sync_state().last_sync > 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_network_listener_drives_online_flag() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        let engine = engine(temp_dir.path(), api).await;
        let listener = ManualNetworkListener::new(NetworkStatus::Offline);
        engine.attach_network_listener(listener.clone()).await.unwrap();
        assert!(!engine.get_sync_state().is_online);

        listener.switch(NetworkStatus::Online);
        for _ in 0..100 {
            if engine.get_sync_state().is_online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.get_sync_state().is_online);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_engine_stops_background_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        let config = SyncConfig::builder()
            .data_dir(temp_dir.path())
            .platform(StorePlatform::Web)
            .replay_interval(Duration::from_secs(1))
            .build();
        let engine = SyncEngine::initialize(config, Some(api.clone() as Arc<dyn RemoteApi>), Arc::new(MemoryQueryCache::new()))
            .await
            .unwrap();
        api.fail_next_writes([MockFailure::Timeout]);
        engine
            .submit_write(OutboxOperation::Create, "/api/wells", json!({"id": "x1"}))
            .await
            .unwrap();
        let token = engine.shutdown_token.clone();
        let writes = api.write_log().len();

        drop(engine);
        assert!(token.is_cancelled());
        // 定时重放不再触发
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(api.write_log().len(), writes);
    }

    #[tokio::test]
    async fn test_backup_moves_replica_and_outbox_to_new_device() {
        let source_dir = TempDir::new().unwrap();
        let source_api = MockRemoteApi::new();
        source_api.set_collection(Collection::Projects, vec![json!({"id": "p1", "name": "Tower"})]);
        let source = engine(source_dir.path(), source_api.clone()).await;
        assert!(source.perform_initial_data_pull().await);
        source_api.fail_next_writes([MockFailure::Timeout]);
        source
            .submit_write(OutboxOperation::Create, "/api/wells", json!({"id": "x1", "depth": 40}))
            .await
            .unwrap();
        let backup = source.export_local_data().await.unwrap();
        source.shutdown().await.unwrap();

        let target_dir = TempDir::new().unwrap();
        let target_api = MockRemoteApi::new();
        let target = engine(target_dir.path(), target_api.clone()).await;
        assert!(!target.is_data_up_to_date(Duration::from_secs(3600)).await);
        assert!(target.import_local_data(&backup).await.unwrap() >= 3);

        assert_eq!(target.get_records(Collection::Projects).await.unwrap().len(), 1);
        assert_eq!(target.get_sync_state().pending_count, 1);
        assert!(target.is_data_up_to_date(Duration::from_secs(3600)).await);

        let report = target.sync_now().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(target_api.write_log().len(), 1);
        target.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_local_data_keeps_pending_writes() {
        let temp_dir = TempDir::new().unwrap();
        let api = MockRemoteApi::new();
        api.set_collection(Collection::Workers, vec![json!({"id": "w1"}), json!({"id": "w2"})]);
        let engine = engine(temp_dir.path(), api.clone()).await;
        assert!(engine.perform_initial_data_pull().await);
        assert!(engine.last_sync_time().await.is_some());

        engine.set_online(false).await;
        engine
            .submit_write(OutboxOperation::Update, "/api/workers/w1", json!({"id": "w1", "name": "Sam"}))
            .await
            .unwrap();

        assert_eq!(engine.clear_local_data().await.unwrap(), 2);
        assert!(engine.get_records(Collection::Workers).await.unwrap().is_empty());
        assert_eq!(engine.pending_writes().await.unwrap().len(), 1);
        assert_eq!(engine.last_sync_time().await, None);
        assert!(!engine.is_data_up_to_date(Duration::from_secs(3600)).await);

        let report = engine.run_cleanup(&CleanupPolicy::default()).await.unwrap();
        assert_eq!(report.total_deleted, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_init_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let result = SyncEngine::initialize(
            config(&blocker, StorePlatform::Native),
            Some(MockRemoteApi::new() as Arc<dyn RemoteApi>),
            Arc::new(MemoryQueryCache::new()),
        )
        .await;
        assert!(matches!(result, Err(SyncError::StoreInit(_))));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(temp_dir.path(), MockRemoteApi::new()).await;
        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(!engine.perform_initial_data_pull().await);
        assert!(matches!(
            engine.queue_for_sync(OutboxOperation::Create, "/api/wells", json!({})).await,
            Err(SyncError::ShuttingDown(_))
        ));
    }
}
