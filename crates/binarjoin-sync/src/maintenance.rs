//! 本地数据维护
//!
//! - 清理：按 `createdAt` 删除过期记录、删除软删除记录、清空本地副本
//! - 新鲜度：根据 `lastSync` 元数据判断本地数据是否过旧
//! - 备份：整个副本（含 outbox 与元数据）导出为 JSON，或从 JSON 导入
//!
//! 尚未同步的乐观记录（`synced: false`）不会被清理。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::collections::{Collection, PULL_ORDER};
use crate::error::{Result, SyncError};
use crate::storage::{record_key, LocalReplicaStore};
use crate::sync::pull::{read_last_sync, LAST_SYNC_KEY};
use crate::version::REPLICA_FORMAT_VERSION;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// 清理策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    /// 早于该时长的记录被删除
    pub max_age: Duration,
    /// 同时删除软删除的记录
    pub remove_soft_deleted: bool,
    pub soft_delete_field: String,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_age: DAY * 30,
            remove_soft_deleted: true,
            soft_delete_field: "isDeleted".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub total_deleted: usize,
    pub deleted_by_collection: BTreeMap<Collection, usize>,
}

/// 导出文件格式
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaExport {
    pub version: u32,
    pub exported_at: i64,
    /// 存储名 → 记录
    pub collections: BTreeMap<String, Vec<Value>>,
}

pub struct ReplicaMaintenance {
    store: Arc<dyn LocalReplicaStore>,
}

impl ReplicaMaintenance {
    pub fn new(store: Arc<dyn LocalReplicaStore>) -> Self {
        Self { store }
    }

    /// 删除 `createdAt` 早于 `max_age` 的记录；没有 `createdAt` 的记录保留
    pub async fn delete_old_records(&self, collection: Collection, max_age: Duration) -> Result<usize> {
        if collection.is_reserved() {
            return Err(SyncError::InvalidArgument(format!("不能清理保留集合 {}", collection)));
        }
        let cutoff = chrono::Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        self.delete_where(collection, |record| {
            created_at_millis(record).is_some_and(|created| created < cutoff)
        })
        .await
    }

    /// 删除 `field == true` 的软删除记录
    pub async fn delete_soft_deleted(&self, collection: Collection, field: &str) -> Result<usize> {
        if collection.is_reserved() {
            return Err(SyncError::InvalidArgument(format!("不能清理保留集合 {}", collection)));
        }
        self.delete_where(collection, |record| record.get(field) == Some(&Value::Bool(true)))
            .await
    }

    async fn delete_where<F>(&self, collection: Collection, predicate: F) -> Result<usize>
    where
        F: Fn(&Value) -> bool,
    {
        let mut deleted = 0;
        for record in self.store.get_all(collection).await? {
            if is_unsynced(&record) || !predicate(&record) {
                continue;
            }
            let Some(key) = record_key(&record) else {
                continue;
            };
            if self.store.remove(collection, &key).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("🗑️ 已从 {} 清理 {} 条记录", collection, deleted);
        }
        Ok(deleted)
    }

    /// 对所有镜像集合执行清理策略；单个集合出错只记录日志
    pub async fn run_cleanup_policy(&self, policy: &CleanupPolicy) -> CleanupReport {
        let mut report = CleanupReport::default();
        for &collection in PULL_ORDER {
            let mut deleted = match self.delete_old_records(collection, policy.max_age).await {
                Ok(n) => n,
                Err(e) => {
                    error!("❌ 清理 {} 过期记录失败: {}", collection, e);
                    0
                }
            };
            if policy.remove_soft_deleted {
                match self.delete_soft_deleted(collection, &policy.soft_delete_field).await {
                    Ok(n) => deleted += n,
                    Err(e) => error!("❌ 清理 {} 软删除记录失败: {}", collection, e),
                }
            }
            report.deleted_by_collection.insert(collection, deleted);
            report.total_deleted += deleted;
        }
        info!("✅ 清理策略执行完毕: 删除 {} 条记录", report.total_deleted);
        report
    }

    /// 清空全部镜像集合和 `lastSync` 记录；outbox 与其他元数据保留
    pub async fn clear_all_local_data(&self) -> Result<usize> {
        let mut cleared = 0;
        for &collection in PULL_ORDER {
            cleared += self.store.count(collection).await?;
            self.store.clear(collection).await?;
        }
        self.store.remove(Collection::SyncMetadata, LAST_SYNC_KEY).await?;
        info!("🧹 已清空本地副本: {} 条记录", cleared);
        Ok(cleared)
    }

    /// 上次全量拉取时间（毫秒时间戳）
    pub async fn last_sync_time(&self) -> Option<i64> {
        match read_last_sync(self.store.as_ref()).await {
            Ok(info) => info.map(|i| i.timestamp).filter(|t| *t > 0),
            Err(e) => {
                warn!("⚠️ 读取 lastSync 失败: {}", e);
                None
            }
        }
    }

    /// 上次全量拉取距今是否不超过 `max_age`；从未拉取过时为 false
    pub async fn is_data_up_to_date(&self, max_age: Duration) -> bool {
        let Some(last) = self.last_sync_time().await else {
            return false;
        };
        let age = chrono::Utc::now().timestamp_millis() - last;
        let fresh = age < max_age.as_millis() as i64;
        debug!("本地数据距上次同步 {}s, 新鲜: {}", age / 1000, fresh);
        fresh
    }

    /// 导出所有集合（含 outbox 与元数据）为格式化 JSON
    pub async fn export_json(&self) -> Result<String> {
        let mut collections = BTreeMap::new();
        for &collection in Collection::ALL {
            collections.insert(collection.as_str().to_string(), self.store.get_all(collection).await?);
        }
        let export = ReplicaExport {
            version: REPLICA_FORMAT_VERSION,
            exported_at: chrono::Utc::now().timestamp_millis(),
            collections,
        };
        let total: usize = export.collections.values().map(Vec::len).sum();
        info!("📦 导出本地副本: {} 个集合，{} 条记录", export.collections.len(), total);
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// 从导出的 JSON 导入；文件中出现的集合被整体替换，未知集合跳过。返回写入的记录数
    pub async fn import_json(&self, json: &str) -> Result<usize> {
        let export: ReplicaExport = serde_json::from_str(json)
            .map_err(|e| SyncError::InvalidData(format!("导入文件格式无效: {}", e)))?;
        if export.version > REPLICA_FORMAT_VERSION {
            return Err(SyncError::InvalidData(format!(
                "导入文件版本 {} 高于当前支持的 {}",
                export.version, REPLICA_FORMAT_VERSION
            )));
        }

        let mut imported = 0;
        for (name, records) in &export.collections {
            let Ok(collection) = name.parse::<Collection>() else {
                warn!("⚠️ 导入时跳过未知集合: {}", name);
                continue;
            };
            imported += self.store.replace_all(collection, records).await?;
        }
        info!("📥 导入本地副本完成: {} 条记录", imported);
        Ok(imported)
    }
}

fn is_unsynced(record: &Value) -> bool {
    record.get("synced") == Some(&Value::Bool(false))
}

/// `createdAt` 转毫秒：数字按毫秒，字符串支持 RFC 3339 与 `YYYY-MM-DD`
fn created_at_millis(record: &Value) -> Option<i64> {
    match record.get("createdAt")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc().timestamp_millis())
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kv_store;
    use serde_json::json;
    use tempfile::TempDir;

    fn days_ago(days: i64) -> i64 {
        chrono::Utc::now().timestamp_millis() - days * 24 * 60 * 60 * 1000
    }

    #[test]
    fn test_created_at_formats() {
        assert_eq!(created_at_millis(&json!({"createdAt": 1_000})), Some(1_000));
        assert_eq!(
            created_at_millis(&json!({"createdAt": "1970-01-01T00:00:02Z"})),
            Some(2_000)
        );
        assert_eq!(created_at_millis(&json!({"createdAt": "1970-01-02"})), Some(86_400_000));
        assert_eq!(created_at_millis(&json!({"createdAt": "yesterday"})), None);
        assert_eq!(created_at_millis(&json!({"id": "x"})), None);
    }

    #[tokio::test]
    async fn test_cleanup_policy_removes_old_and_soft_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let store = kv_store(temp_dir.path()).await;
        store
            .put_many(
                Collection::WorkerAttendance,
                &[
                    json!({"id": "old", "createdAt": days_ago(45)}),
                    json!({"id": "old-pending", "createdAt": days_ago(45), "synced": false}),
                    json!({"id": "recent", "createdAt": days_ago(2)}),
                    json!({"id": "undated"}),
                    json!({"id": "removed", "createdAt": days_ago(1), "isDeleted": true}),
                ],
            )
            .await
            .unwrap();

        let maintenance = ReplicaMaintenance::new(store.clone());
        let report = maintenance.run_cleanup_policy(&CleanupPolicy::default()).await;
        assert_eq!(report.total_deleted, 2);
        assert_eq!(report.deleted_by_collection[&Collection::WorkerAttendance], 2);

        let mut left: Vec<String> = store
            .get_all(Collection::WorkerAttendance)
            .await
            .unwrap()
            .iter()
            .filter_map(record_key)
            .collect();
        left.sort();
        assert_eq!(left, vec!["old-pending", "recent", "undated"]);

        assert!(matches!(
            maintenance.delete_old_records(Collection::SyncQueue, DAY).await,
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_all_keeps_outbox_and_scope() {
        let temp_dir = TempDir::new().unwrap();
        let store = kv_store(temp_dir.path()).await;
        store.put(Collection::Workers, &json!({"id": "w1"})).await.unwrap();
        store.put(Collection::Projects, &json!({"id": "p1"})).await.unwrap();
        store.put(Collection::SyncQueue, &json!({"id": "e1"})).await.unwrap();
        store
            .put(Collection::SyncMetadata, &json!({"key": LAST_SYNC_KEY, "timestamp": days_ago(0), "version": 1, "recordCount": 2}))
            .await
            .unwrap();
        store
            .put(Collection::SyncMetadata, &json!({"key": "selectedProject", "scope": "p1"}))
            .await
            .unwrap();

        let maintenance = ReplicaMaintenance::new(store.clone());
        assert!(maintenance.is_data_up_to_date(DAY).await);
        assert_eq!(maintenance.clear_all_local_data().await.unwrap(), 2);

        assert_eq!(store.count(Collection::Workers).await.unwrap(), 0);
        assert_eq!(store.count(Collection::SyncQueue).await.unwrap(), 1);
        assert!(store.get(Collection::SyncMetadata, "selectedProject").await.unwrap().is_some());
        assert_eq!(maintenance.last_sync_time().await, None);
        assert!(!maintenance.is_data_up_to_date(DAY).await);
    }

    #[tokio::test]
    async fn test_stale_last_sync_is_not_up_to_date() {
        let temp_dir = TempDir::new().unwrap();
        let store = kv_store(temp_dir.path()).await;
        let maintenance = ReplicaMaintenance::new(store.clone());
        assert!(!maintenance.is_data_up_to_date(DAY).await);

        let synced_at = days_ago(3);
        store
            .put(Collection::SyncMetadata, &json!({"key": LAST_SYNC_KEY, "timestamp": synced_at, "version": 1, "recordCount": 0}))
            .await
            .unwrap();
        assert_eq!(maintenance.last_sync_time().await, Some(synced_at));
        assert!(!maintenance.is_data_up_to_date(DAY).await);
        assert!(maintenance.is_data_up_to_date(DAY * 7).await);
    }

    #[tokio::test]
    async fn test_export_then_import_into_fresh_store() {
        let source_dir = TempDir::new().unwrap();
        let source = kv_store(source_dir.path()).await;
        source.put(Collection::Materials, &json!({"id": "m1", "name": "Steel"})).await.unwrap();
        source.put(Collection::SyncQueue, &json!({"id": "e1", "seq": 1})).await.unwrap();
        let exported = ReplicaMaintenance::new(source).export_json().await.unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = kv_store(target_dir.path()).await;
        target.put(Collection::Materials, &json!({"id": "stale"})).await.unwrap();
        let imported = ReplicaMaintenance::new(target.clone()).import_json(&exported).await.unwrap();
        assert_eq!(imported, 2);

        let materials = target.get_all(Collection::Materials).await.unwrap();
        assert_eq!(materials, vec![json!({"id": "m1", "name": "Steel"})]);
        assert_eq!(target.count(Collection::SyncQueue).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_import_rejects_bad_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = kv_store(temp_dir.path()).await;
        let maintenance = ReplicaMaintenance::new(store.clone());

        assert!(matches!(maintenance.import_json("not json").await, Err(SyncError::InvalidData(_))));
        let newer = json!({"version": REPLICA_FORMAT_VERSION + 1, "exportedAt": 0, "collections": {}});
        assert!(matches!(
            maintenance.import_json(&newer.to_string()).await,
            Err(SyncError::InvalidData(_))
        ));

        let unknown = json!({
            "version": REPLICA_FORMAT_VERSION,
            "exportedAt": 0,
            "collections": {"expenses": [{"id": "x"}], "wells": [{"id": "x1"}]}
        });
        assert_eq!(maintenance.import_json(&unknown.to_string()).await.unwrap(), 1);
        assert_eq!(store.count(Collection::Wells).await.unwrap(), 1);
    }
}
