//! 全量拉取编排（Initial Pull）
//!
//! 按 [`PULL_ORDER`] 依次拉取每个远端集合并整体替换本地副本（远端为准）。
//!
//! - 单个集合失败只记录，不中断其余集合
//! - 每个集合的请求发出前上报进度，订阅者看到的 `current` 单调递增
//! - 并发度 > 1 时请求可以并行发出，但提交仍严格按固定顺序
//! - 完成后在 `syncMetadata` 写入 `lastSync` 记录
//!
//! 返回值：至少一个集合成功时为 true；离线、已有拉取在进行或全部失败时为 false。

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::state::SyncStateManager;
use crate::collections::{Collection, PULL_ORDER};
use crate::config::PullConfig;
use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::http_client::RemoteApi;
use crate::storage::LocalReplicaStore;
use crate::version::REPLICA_FORMAT_VERSION;

/// `syncMetadata` 中记录上次全量拉取的 key
pub const LAST_SYNC_KEY: &str = "lastSync";

/// 上次全量拉取的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSyncInfo {
    pub timestamp: i64,
    pub version: u32,
    /// 本次写入本地的记录总数
    pub record_count: usize,
    /// 成功拉取的集合名
    #[serde(default)]
    pub tables: Vec<String>,
}

pub struct InitialPullOrchestrator {
    store: Arc<dyn LocalReplicaStore>,
    api: Arc<dyn RemoteApi>,
    state: SyncStateManager,
    events: Arc<EventManager>,
    config: PullConfig,
    collections: Vec<Collection>,
}

impl InitialPullOrchestrator {
    pub fn new(
        store: Arc<dyn LocalReplicaStore>,
        api: Arc<dyn RemoteApi>,
        state: SyncStateManager,
        events: Arc<EventManager>,
        config: PullConfig,
    ) -> Self {
        Self::with_collections(store, api, state, events, config, PULL_ORDER.to_vec())
    }

    /// 只拉取指定集合（顺序即提交顺序）；保留集合会被忽略
    pub fn with_collections(
        store: Arc<dyn LocalReplicaStore>,
        api: Arc<dyn RemoteApi>,
        state: SyncStateManager,
        events: Arc<EventManager>,
        config: PullConfig,
        collections: Vec<Collection>,
    ) -> Self {
        let collections = collections.into_iter().filter(|c| !c.is_reserved()).collect();
        Self {
            store,
            api,
            state,
            events,
            config,
            collections,
        }
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    /// 执行一次全量拉取
    pub async fn perform_initial_data_pull(&self) -> bool {
        if !self.state.is_online() {
            info!("📴 离线状态，跳过全量拉取");
            return false;
        }
        let total = self.collections.len();
        if !self.state.begin_pull(total) {
            warn!("⏳ 全量拉取已在进行中，忽略本次请求");
            return false;
        }

        info!("🔄 开始全量拉取: {} 个集合", total);
        self.events
            .emit(SyncEvent::PullStarted {
                total,
                timestamp: now_millis(),
            })
            .await;

        let timeout = self.config.request_timeout();
        let api = self.api.clone();
        let state = self.state.clone();
        // buffered 按输入顺序首次轮询并产出结果
        let mut results = stream::iter(self.collections.iter().copied().enumerate())
            .map(|(i, collection)| {
                let api = api.clone();
                let state = state.clone();
                async move {
                    state.set_progress(i + 1, total, collection.as_str());
                    let outcome = match tokio::time::timeout(timeout, api.fetch_collection(collection)).await {
                        Ok(result) => result,
                        Err(_) => Err(SyncError::Timeout(format!(
                            "拉取 {} 超过 {} 秒",
                            collection,
                            timeout.as_secs()
                        ))),
                    };
                    (collection, outcome)
                }
            })
            .buffered(self.config.concurrency.max(1));

        let mut pulled_tables = Vec::new();
        let mut record_count = 0;
        let mut index = 0;
        while let Some((collection, outcome)) = results.next().await {
            index += 1;
            let committed = match outcome {
                Ok(records) => self.commit(collection, &records).await,
                Err(e) => Err(e),
            };
            match committed {
                Ok(count) => {
                    debug!("📥 {} 已同步 {} 条记录 ({}/{})", collection, count, index, total);
                    self.state.record_success();
                    record_count += count;
                    pulled_tables.push(collection.as_str().to_string());
                    self.events
                        .emit(SyncEvent::CollectionPulled {
                            collection,
                            record_count: count,
                            timestamp: now_millis(),
                        })
                        .await;
                }
                Err(e) => {
                    let err = SyncError::pull(collection, e.to_string());
                    error!("❌ {}", err);
                    self.state.record_failure(format!("{}: {}", collection, e));
                    self.events
                        .emit(SyncEvent::CollectionPullFailed {
                            collection,
                            error: e.to_string(),
                            timestamp: now_millis(),
                        })
                        .await;
                }
            }
        }

        let snapshot = self.state.finish_pull();
        info!("📊 全量拉取结束: {}", snapshot.summary());

        let info = LastSyncInfo {
            timestamp: snapshot.last_sync,
            version: REPLICA_FORMAT_VERSION,
            record_count,
            tables: pulled_tables,
        };
        if let Err(e) = self.write_last_sync(&info).await {
            warn!("⚠️ 写入 lastSync 元数据失败: {}", e);
        }

        self.events
            .emit(SyncEvent::PullCompleted {
                synced_count: snapshot.synced_count,
                failed_count: snapshot.failed_count,
                timestamp: now_millis(),
            })
            .await;

        snapshot.synced_count > 0
    }

    async fn commit(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        self.store.replace_all(collection, records).await
    }

    async fn write_last_sync(&self, info: &LastSyncInfo) -> Result<()> {
        let mut record = serde_json::to_value(info)?;
        if let Some(obj) = record.as_object_mut() {
            obj.insert("key".to_string(), json!(LAST_SYNC_KEY));
        }
        self.store.put(Collection::SyncMetadata, &record).await?;
        Ok(())
    }

    /// 读取上次全量拉取的元数据
    pub async fn last_sync_info(&self) -> Result<Option<LastSyncInfo>> {
        read_last_sync(self.store.as_ref()).await
    }
}

pub async fn read_last_sync(store: &dyn LocalReplicaStore) -> Result<Option<LastSyncInfo>> {
    match store.get(Collection::SyncMetadata, LAST_SYNC_KEY).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
