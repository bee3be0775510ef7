//! Outbox 队列 - 未能送达服务端的写操作的持久化队列
//!
//! - 条目保存在副本存储的保留集合 `syncQueue` 中，进程重启后仍在
//! - 本模块不主动重试；重放由外部触发（恢复联网、回到前台、定时器、手动「立即同步」）
//! - 重放按插入顺序（`seq`）进行，同一资源族严格 FIFO：前面的条目未成功，后面的条目本轮不发送
//! - 重试次数耗尽或被服务端拒绝的条目保留为「需人工处理」，绝不自动丢弃

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::retry_policy::{ReplayFailureReason, RetryPolicy};
use super::state::SyncStateManager;
use crate::collections::{resource_family, Collection};
use crate::error::{Result, SyncError};
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::http_client::RemoteApi;
use crate::storage::{record_key, LocalReplicaStore};

/// 写操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOperation {
    Create,
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OutboxOperation {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "post" => Ok(Self::Create),
            "update" | "patch" | "put" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for OutboxOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    /// 重试耗尽或被服务端拒绝，等待用户处理
    NeedsAttention,
}

/// Outbox 条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    /// 插入序号，重放顺序以此为准
    pub seq: u64,
    pub operation: OutboxOperation,
    pub endpoint: String,
    pub payload: Value,
    /// 毫秒时间戳
    pub created_at: i64,
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// 最近一次失败的分类（timeout / network / server / validation ...）
    #[serde(default)]
    pub failure_kind: Option<String>,
    #[serde(default)]
    pub next_retry_at: Option<i64>,
    pub status: EntryStatus,
    /// 乐观写入前的本地记录，取消条目时据此还原
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

impl OutboxEntry {
    fn new(seq: u64, operation: OutboxOperation, endpoint: String, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            operation,
            endpoint,
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
            retries: 0,
            last_error: None,
            failure_kind: None,
            next_retry_at: None,
            status: EntryStatus::Pending,
            previous: None,
        }
    }

    pub fn needs_attention(&self) -> bool {
        self.status == EntryStatus::NeedsAttention
    }

    /// 目标记录主键：payload 中的 id/key，否则取 endpoint 的最后一段（`/api/workers/w1` → `w1`）
    pub fn target_key(&self) -> Option<String> {
        record_key(&self.payload).or_else(|| {
            let path = self.endpoint.split(['?', '#']).next().unwrap_or_default();
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            let family_index = segments.iter().position(|s| *s == "api").map(|i| i + 1).unwrap_or(0);
            segments.get(family_index + 1).map(|s| s.to_string())
        })
    }
}

/// 一轮重放的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 因同族前序条目阻塞或退避未到而跳过
    pub skipped: usize,
    pub needs_attention: usize,
    /// 遇到连接层错误，提前结束本轮
    pub aborted: bool,
}

/// 诊断页统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub total: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    /// 至少失败过一次的条目
    pub failed: usize,
    pub needs_attention: usize,
    pub oldest_created_at: Option<i64>,
}

pub struct OutboxQueue {
    store: Arc<dyn LocalReplicaStore>,
    api: Arc<dyn RemoteApi>,
    state: SyncStateManager,
    events: Arc<EventManager>,
    policy: RetryPolicy,
    next_seq: AtomicU64,
    /// 同一时间只允许一轮重放
    replay_lock: tokio::sync::Mutex<()>,
}

impl OutboxQueue {
    /// 打开队列，从已持久化的条目恢复插入序号
    pub async fn open(
        store: Arc<dyn LocalReplicaStore>,
        api: Arc<dyn RemoteApi>,
        state: SyncStateManager,
        events: Arc<EventManager>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let queue = Self {
            store,
            api,
            state,
            events,
            policy,
            next_seq: AtomicU64::new(1),
            replay_lock: tokio::sync::Mutex::new(()),
        };
        let restored = queue.reload().await?;
        if restored > 0 {
            info!("📦 outbox 恢复 {} 条待同步操作", restored);
        }
        Ok(queue)
    }

    /// 从存储重新读取条目，恢复插入序号与待同步数量（导入备份后调用）
    pub(crate) async fn reload(&self) -> Result<usize> {
        let _guard = self.replay_lock.lock().await;
        let entries = self.pending().await?;
        let max_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        self.next_seq.store(max_seq + 1, Ordering::SeqCst);
        self.state.set_pending_count(entries.len());
        Ok(entries.len())
    }

    /// 把一次失败的直接写保存为 outbox 条目，返回条目 ID
    ///
    /// 在直接写远端失败的位置调用；同时把变更乐观地应用到本地副本（标记 `synced: false`）。
    pub async fn queue_for_sync(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: Value,
    ) -> Result<String> {
        self.enqueue(operation, endpoint, payload, None).await
    }

    /// 直接写失败后入队，并把失败原因记为条目的 `last_error`
    pub(crate) async fn queue_failed_write(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: Value,
        failure: &SyncError,
    ) -> Result<String> {
        self.enqueue(operation, endpoint, payload, Some(failure.to_string())).await
    }

    async fn enqueue(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: Value,
        last_error: Option<String>,
    ) -> Result<String> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(SyncError::InvalidArgument("endpoint 不能为空".to_string()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut entry = OutboxEntry::new(seq, operation, endpoint.to_string(), payload);
        entry.previous = self.local_target(&entry).await;
        entry.last_error = last_error;
        self.persist(&entry).await?;
        info!(
            "💾 已保存到本地，稍后同步: {} {} (entry={}, seq={})",
            operation, entry.endpoint, entry.id, seq
        );

        self.apply_optimistic(&entry).await;
        self.refresh_pending_count().await;
        self.events
            .emit(SyncEvent::WriteQueued {
                entry_id: entry.id.clone(),
                operation,
                endpoint: entry.endpoint.clone(),
                timestamp: now_millis(),
            })
            .await;
        Ok(entry.id)
    }

    /// 全部条目，按插入顺序
    pub async fn pending(&self) -> Result<Vec<OutboxEntry>> {
        let raw = self.store.get_all(Collection::SyncQueue).await?;
        let mut entries: Vec<OutboxEntry> = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<OutboxEntry>(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("⚠️ outbox 条目无法解析，已跳过: {}", e);
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| a.seq.cmp(&b.seq).then(a.created_at.cmp(&b.created_at)));
        Ok(entries)
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.count(Collection::SyncQueue).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// 需要人工处理的条目
    pub async fn attention_required(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self
            .pending()
            .await?
            .into_iter()
            .filter(OutboxEntry::needs_attention)
            .collect())
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        let entries = self.pending().await?;
        let mut stats = OutboxStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.operation {
                OutboxOperation::Create => stats.creates += 1,
                OutboxOperation::Update => stats.updates += 1,
                OutboxOperation::Delete => stats.deletes += 1,
            }
            if entry.retries > 0 {
                stats.failed += 1;
            }
            if entry.needs_attention() {
                stats.needs_attention += 1;
            }
        }
        stats.oldest_created_at = entries.iter().map(|e| e.created_at).min();
        Ok(stats)
    }

    /// 按退避计划重放
    pub async fn replay(&self) -> Result<ReplayReport> {
        self.replay_inner(false).await
    }

    /// 忽略退避时间立即重放（用户点击「立即同步」）
    pub async fn replay_now(&self) -> Result<ReplayReport> {
        self.replay_inner(true).await
    }

    async fn replay_inner(&self, ignore_backoff: bool) -> Result<ReplayReport> {
        let _guard = self.replay_lock.lock().await;
        let entries = self.pending().await?;
        let mut report = ReplayReport::default();
        if entries.is_empty() {
            self.state.set_pending_count(0);
            return Ok(report);
        }

        info!("🔄 开始重放 outbox: {} 条", entries.len());
        let now = chrono::Utc::now().timestamp_millis();
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            let family = resource_family(&entry.endpoint);
            if report.aborted || blocked.contains(&family) {
                report.skipped += 1;
                continue;
            }
            if entry.needs_attention() {
                debug!("⏸️ 条目 {} 需人工处理，阻塞资源族 {}", entry.id, family);
                report.needs_attention += 1;
                blocked.insert(family);
                continue;
            }
            if !ignore_backoff && entry.next_retry_at.is_some_and(|t| t > now) {
                report.skipped += 1;
                blocked.insert(family);
                continue;
            }

            report.attempted += 1;
            let result = self
                .api
                .send(entry.operation, &entry.endpoint, &entry.payload, Some(&entry.id))
                .await;
            match result {
                Ok(response) => {
                    self.store.remove(Collection::SyncQueue, &entry.id).await?;
                    self.apply_confirmed(&entry, response).await;
                    report.succeeded += 1;
                    info!("✅ 重放成功: {} {} (entry={})", entry.operation, entry.endpoint, entry.id);
                    self.events
                        .emit(SyncEvent::EntryReplayed {
                            entry_id: entry.id.clone(),
                            endpoint: entry.endpoint.clone(),
                            timestamp: now_millis(),
                        })
                        .await;
                }
                Err(e) => {
                    report.failed += 1;
                    if e.is_connectivity() {
                        report.aborted = true;
                    }
                    blocked.insert(family);
                    if self.record_failure(entry, &e).await? {
                        report.needs_attention += 1;
                    }
                }
            }
        }

        self.refresh_pending_count().await;
        info!(
            "📊 outbox 重放结束: 尝试 {}，成功 {}，失败 {}，跳过 {}，待处理 {}",
            report.attempted, report.succeeded, report.failed, report.skipped, report.needs_attention
        );
        Ok(report)
    }

    /// 记录一次失败；返回条目是否转为「需人工处理」
    async fn record_failure(&self, mut entry: OutboxEntry, err: &SyncError) -> Result<bool> {
        let reason = ReplayFailureReason::from(err);
        entry.retries += 1;
        entry.last_error = Some(err.to_string());
        entry.failure_kind = Some(reason.kind().to_string());

        entry.next_retry_at =
            self.policy
                .calculate_next_retry_time(entry.retries, &reason, chrono::Utc::now().timestamp_millis());
        let exhausted = entry.next_retry_at.is_none();
        if exhausted {
            entry.status = EntryStatus::NeedsAttention;
        }
        self.persist(&entry).await?;

        let replay_err = SyncError::ReplayExhausted {
            entry_id: entry.id.clone(),
            attempts: entry.retries,
            last_error: err.to_string(),
        };
        if exhausted {
            error!("🚨 {}", replay_err);
            self.events
                .emit(SyncEvent::AttentionRequired {
                    entry_id: entry.id.clone(),
                    endpoint: entry.endpoint.clone(),
                    attempts: entry.retries,
                    error: err.to_string(),
                    timestamp: now_millis(),
                })
                .await;
        } else {
            warn!(
                "⚠️ 重放失败 ({}/{}): {} {} - {}",
                entry.retries, self.policy.max_retries, entry.operation, entry.endpoint, err
            );
        }
        self.events
            .emit(SyncEvent::ReplayFailed {
                entry_id: entry.id,
                endpoint: entry.endpoint,
                attempts: entry.retries,
                error: err.to_string(),
                timestamp: now_millis(),
            })
            .await;
        Ok(exhausted)
    }

    /// 移除单个条目（用户放弃这次修改），并撤销它在本地副本中的乐观写入
    ///
    /// 同一条记录还有其他未同步条目时保留本地记录，由后续条目继续覆盖。
    pub async fn cancel(&self, entry_id: &str) -> Result<bool> {
        let _guard = self.replay_lock.lock().await;
        let Some(value) = self.store.get(Collection::SyncQueue, entry_id).await? else {
            return Ok(false);
        };
        let entry: Option<OutboxEntry> = match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("⚠️ 取消的 outbox 条目无法解析，不还原本地记录: {}", e);
                None
            }
        };
        if !self.store.remove(Collection::SyncQueue, entry_id).await? {
            return Ok(false);
        }

        if let Some(entry) = entry {
            let target = entry_target(&entry);
            let shared = self
                .pending()
                .await?
                .iter()
                .any(|other| target.is_some() && entry_target(other) == target);
            if shared {
                debug!("记录仍有其他未同步修改，保留本地副本: {}", entry.endpoint);
            } else {
                self.revert_optimistic(&entry).await;
            }
        }
        info!("🗑️ 已取消 outbox 条目: {}", entry_id);
        self.refresh_pending_count().await;
        Ok(true)
    }

    /// 清空队列，返回被移除的条目数；按从新到旧的顺序撤销乐观写入
    pub async fn cancel_all(&self) -> Result<usize> {
        let _guard = self.replay_lock.lock().await;
        let entries = self.pending().await?;
        let count = self.len().await?;
        self.store.clear(Collection::SyncQueue).await?;
        for entry in entries.iter().rev() {
            self.revert_optimistic(entry).await;
        }
        self.state.set_pending_count(0);
        info!("🗑️ 已清空 outbox: {} 条", count);
        Ok(count)
    }

    /// 把「需人工处理」的条目恢复为待重放，重试计数清零
    pub async fn retry_entry(&self, entry_id: &str) -> Result<bool> {
        let _guard = self.replay_lock.lock().await;
        let Some(value) = self.store.get(Collection::SyncQueue, entry_id).await? else {
            return Ok(false);
        };
        let mut entry: OutboxEntry = serde_json::from_value(value)?;
        entry.status = EntryStatus::Pending;
        entry.retries = 0;
        entry.next_retry_at = None;
        self.persist(&entry).await?;
        Ok(true)
    }

    async fn persist(&self, entry: &OutboxEntry) -> Result<()> {
        let value = serde_json::to_value(entry)?;
        if !self.store.put(Collection::SyncQueue, &value).await? {
            return Err(SyncError::InvalidData(format!("outbox 条目无法写入: {}", entry.id)));
        }
        Ok(())
    }

    async fn refresh_pending_count(&self) {
        match self.len().await {
            Ok(n) => self.state.set_pending_count(n),
            Err(e) => warn!("⚠️ 统计 outbox 条目失败: {}", e),
        }
    }

    /// 直接写成功后同步更新本地副本
    pub(crate) async fn apply_direct_write(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: Value,
        response: Option<Value>,
    ) {
        let entry = OutboxEntry::new(0, operation, endpoint.to_string(), payload);
        self.apply_confirmed(&entry, response).await;
    }

    /// 入队时把变更先写进本地副本，离线时界面能立即看到
    async fn apply_optimistic(&self, entry: &OutboxEntry) {
        let Some(collection) = Collection::from_endpoint(&entry.endpoint) else {
            return;
        };
        let Some(key) = entry.target_key() else {
            return;
        };
        let result = match entry.operation {
            OutboxOperation::Delete => self.store.remove(collection, &key).await.map(|_| ()),
            OutboxOperation::Create | OutboxOperation::Update => {
                let mut record = self.merged_record(collection, &key, entry).await;
                if let Some(obj) = record.as_object_mut() {
                    obj.insert("synced".to_string(), Value::Bool(false));
                }
                self.store.put(collection, &record).await.map(|_| ())
            }
        };
        if let Err(e) = result {
            warn!("⚠️ 本地乐观写入失败 {}/{}: {}", collection, key, e);
        }
    }

    /// 条目目标记录的当前本地副本
    async fn local_target(&self, entry: &OutboxEntry) -> Option<Value> {
        let (collection, key) = entry_target(entry)?;
        match self.store.get(collection, &key).await {
            Ok(record) => record,
            Err(e) => {
                warn!("⚠️ 读取本地记录失败 {}/{}: {}", collection, key, e);
                None
            }
        }
    }

    /// 撤销乐观写入
    ///
    /// 本地记录已被服务端数据覆盖（不再带 `synced: false`）时保持不动。
    async fn revert_optimistic(&self, entry: &OutboxEntry) {
        let Some((collection, key)) = entry_target(entry) else {
            return;
        };
        let current = match self.store.get(collection, &key).await {
            Ok(current) => current,
            Err(e) => {
                warn!("⚠️ 读取本地记录失败 {}/{}: {}", collection, key, e);
                return;
            }
        };
        let result = match (entry.operation, current) {
            (OutboxOperation::Delete, None) => match &entry.previous {
                Some(previous) => self.store.put(collection, previous).await.map(|_| ()),
                None => Ok(()),
            },
            (OutboxOperation::Create | OutboxOperation::Update, Some(current))
                if current.get("synced") == Some(&Value::Bool(false)) =>
            {
                match &entry.previous {
                    Some(previous) => self.store.put(collection, previous).await.map(|_| ()),
                    None => self.store.remove(collection, &key).await.map(|_| ()),
                }
            }
            _ => Ok(()),
        };
        match result {
            Ok(()) => debug!("↩️ 已撤销本地乐观写入 {}/{}", collection, key),
            Err(e) => warn!("⚠️ 撤销本地乐观写入失败 {}/{}: {}", collection, key, e),
        }
    }

    /// 服务端确认后更新本地副本：优先使用服务端回写的记录
    async fn apply_confirmed(&self, entry: &OutboxEntry, response: Option<Value>) {
        let Some(collection) = Collection::from_endpoint(&entry.endpoint) else {
            debug!("endpoint {} 不对应本地集合，跳过本地更新", entry.endpoint);
            return;
        };
        if let Err(e) = self.write_confirmed(collection, entry, response).await {
            warn!("⚠️ 重放成功但本地更新失败 {}: {}", entry.endpoint, e);
        }
    }

    async fn write_confirmed(
        &self,
        collection: Collection,
        entry: &OutboxEntry,
        response: Option<Value>,
    ) -> Result<()> {
        let local_key = entry.target_key();
        if entry.operation == OutboxOperation::Delete {
            if let Some(key) = &local_key {
                self.store.remove(collection, key).await?;
            }
            return Ok(());
        }

        let record = match (response.filter(Value::is_object), &local_key) {
            (Some(server_record), _) => server_record,
            (None, Some(key)) => {
                let mut merged = self.merged_record(collection, key, entry).await;
                if let Some(obj) = merged.as_object_mut() {
                    obj.remove("synced");
                }
                merged
            }
            (None, None) => entry.payload.clone(),
        };
        // 服务端分配了新主键时移除乐观写入的旧记录
        if let Some(old) = &local_key {
            if record_key(&record).as_deref() != Some(old.as_str()) {
                self.store.remove(collection, old).await?;
            }
        }
        self.store.put(collection, &record).await?;
        Ok(())
    }

    /// 本地已有记录 + payload 字段（浅合并）
    async fn merged_record(&self, collection: Collection, key: &str, entry: &OutboxEntry) -> Value {
        let existing = match entry.operation {
            OutboxOperation::Update => self.store.get(collection, key).await.ok().flatten(),
            _ => None,
        };
        let mut record = existing.unwrap_or_else(|| {
            let mut seed = serde_json::Map::new();
            seed.insert(collection.key_field().to_string(), Value::String(key.to_string()));
            Value::Object(seed)
        });
        match (record.as_object_mut(), entry.payload.as_object()) {
            (Some(target), Some(patch)) => {
                for (k, v) in patch {
                    target.insert(k.clone(), v.clone());
                }
                record
            }
            _ => entry.payload.clone(),
        }
    }
}

/// 条目对应的本地集合与记录主键
fn entry_target(entry: &OutboxEntry) -> Option<(Collection, String)> {
    let collection = Collection::from_endpoint(&entry.endpoint)?;
    Some((collection, entry.target_key()?))
}
