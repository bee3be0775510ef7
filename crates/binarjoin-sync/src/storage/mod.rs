//! 本地副本存储 - 同一套按集合 CRUD 接口，两种后端
//!
//! - `Web`：sled 文档存储（每个集合一棵 tree）
//! - `Native`：SQLite 文件存储（每个集合一张表，由 refinery migrations 建表）
//!
//! 后端在启动时由 [`StorePlatform`] 探测一次，之后引擎其余部分只看到 [`LocalReplicaStore`]。

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::collections::Collection;
use crate::error::Result;

pub mod kv;
pub mod migrate;
pub mod sqlite;

pub use kv::KvReplicaStore;
pub use sqlite::SqliteReplicaStore;

/// 存储后端选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorePlatform {
    /// 按编译目标自动探测
    #[default]
    Auto,
    /// 文档型存储（sled）
    Web,
    /// 关系型文件存储（SQLite）
    Native,
}

impl StorePlatform {
    /// 平台探测：移动端使用 SQLite，其余使用文档存储
    pub fn detect() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            StorePlatform::Native
        } else {
            StorePlatform::Web
        }
    }

    /// 把 `Auto` 解析为具体后端
    pub fn resolve(self) -> Self {
        match self {
            StorePlatform::Auto => Self::detect(),
            other => other,
        }
    }
}

/// 取记录主键：优先 `id`，其次 `key`；数字主键转为字符串
pub fn record_key(record: &Value) -> Option<String> {
    ["id", "key"].iter().find_map(|field| match record.get(*field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// 过滤出带主键的记录，无主键的记录记日志后跳过
pub(crate) fn keyed_records<'a>(
    collection: Collection,
    records: &'a [Value],
) -> Vec<(String, &'a Value)> {
    records
        .iter()
        .filter_map(|record| match record_key(record) {
            Some(key) => Some((key, record)),
            None => {
                warn!("⚠️ [{}] 记录缺少 id/key，已跳过", collection);
                None
            }
        })
        .collect()
}

/// 本地副本存储接口
///
/// 除 `initialize` 外，所有操作失败时只返回错误，不会 panic；无主键的记录被跳过并记录日志。
#[async_trait::async_trait]
pub trait LocalReplicaStore: Send + Sync {
    /// 创建存储与 schema（幂等）；失败为致命错误 `SyncError::StoreInit`
    async fn initialize(&self) -> Result<()>;

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>>;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>>;

    /// 写入单条记录（同主键覆盖）；记录无主键时返回 `Ok(false)`
    async fn put(&self, collection: Collection, record: &Value) -> Result<bool>;

    /// 批量写入，返回实际写入条数
    async fn put_many(&self, collection: Collection, records: &[Value]) -> Result<usize>;

    /// 原子替换整个集合（clear + 批量 put 在同一事务内）
    async fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<usize>;

    async fn remove(&self, collection: Collection, key: &str) -> Result<bool>;

    async fn count(&self, collection: Collection) -> Result<usize>;

    async fn clear(&self, collection: Collection) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// 副本存储枚举 - 启动时选定一种后端
#[derive(Debug)]
pub enum ReplicaStore {
    Kv(KvReplicaStore),
    Sqlite(SqliteReplicaStore),
}

impl ReplicaStore {
    /// 按平台选择后端（不触碰磁盘，真正打开发生在 `initialize`）
    pub fn for_platform(platform: StorePlatform, data_dir: &Path) -> Self {
        match platform.resolve() {
            StorePlatform::Native => ReplicaStore::Sqlite(SqliteReplicaStore::new(data_dir)),
            _ => ReplicaStore::Kv(KvReplicaStore::new(data_dir)),
        }
    }

    /// 诊断用：各集合记录数，读取失败的集合计为 0
    pub async fn collection_counts(&self) -> Vec<(Collection, usize)> {
        let mut counts = Vec::with_capacity(Collection::ALL.len());
        for &collection in Collection::ALL {
            let n = match self.count(collection).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("⚠️ 统计集合 {} 失败: {}", collection, e);
                    0
                }
            };
            counts.push((collection, n));
        }
        counts
    }
}

#[async_trait::async_trait]
impl LocalReplicaStore for ReplicaStore {
    async fn initialize(&self) -> Result<()> {
        match self {
            ReplicaStore::Kv(s) => s.initialize().await,
            ReplicaStore::Sqlite(s) => s.initialize().await,
        }
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        match self {
            ReplicaStore::Kv(s) => s.get_all(collection).await,
            ReplicaStore::Sqlite(s) => s.get_all(collection).await,
        }
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        match self {
            ReplicaStore::Kv(s) => s.get(collection, key).await,
            ReplicaStore::Sqlite(s) => s.get(collection, key).await,
        }
    }

    async fn put(&self, collection: Collection, record: &Value) -> Result<bool> {
        match self {
            ReplicaStore::Kv(s) => s.put(collection, record).await,
            ReplicaStore::Sqlite(s) => s.put(collection, record).await,
        }
    }

    async fn put_many(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        match self {
            ReplicaStore::Kv(s) => s.put_many(collection, records).await,
            ReplicaStore::Sqlite(s) => s.put_many(collection, records).await,
        }
    }

    async fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        match self {
            ReplicaStore::Kv(s) => s.replace_all(collection, records).await,
            ReplicaStore::Sqlite(s) => s.replace_all(collection, records).await,
        }
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<bool> {
        match self {
            ReplicaStore::Kv(s) => s.remove(collection, key).await,
            ReplicaStore::Sqlite(s) => s.remove(collection, key).await,
        }
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        match self {
            ReplicaStore::Kv(s) => s.count(collection).await,
            ReplicaStore::Sqlite(s) => s.count(collection).await,
        }
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        match self {
            ReplicaStore::Kv(s) => s.clear(collection).await,
            ReplicaStore::Sqlite(s) => s.clear(collection).await,
        }
    }

    fn backend_name(&self) -> &'static str {
        match self {
            ReplicaStore::Kv(s) => s.backend_name(),
            ReplicaStore::Sqlite(s) => s.backend_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_record_key() {
        assert_eq!(record_key(&json!({"id": "w1"})).as_deref(), Some("w1"));
        assert_eq!(record_key(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(record_key(&json!({"key": "lastSync"})).as_deref(), Some("lastSync"));
        assert_eq!(record_key(&json!({"id": "", "key": "k"})).as_deref(), Some("k"));
        assert_eq!(record_key(&json!({"name": "x"})), None);
    }

    #[test]
    fn test_platform_resolution() {
        assert_eq!(StorePlatform::Web.resolve(), StorePlatform::Web);
        assert_eq!(StorePlatform::Native.resolve(), StorePlatform::Native);
        assert_ne!(StorePlatform::Auto.resolve(), StorePlatform::Auto);
    }

    /// 两种后端必须表现一致
    async fn exercise_contract(store: ReplicaStore) {
        store.initialize().await.unwrap();
        // 幂等
        store.initialize().await.unwrap();

        let c = Collection::Workers;
        assert_eq!(store.count(c).await.unwrap(), 0);
        assert!(store.put(c, &json!({"id": "w1", "name": "Ali"})).await.unwrap());
        assert!(!store.put(c, &json!({"name": "no key"})).await.unwrap());
        assert!(store.put(c, &json!({"id": "w1", "name": "Ali 2"})).await.unwrap());
        assert_eq!(store.count(c).await.unwrap(), 1);
        assert_eq!(store.get(c, "w1").await.unwrap().unwrap()["name"], "Ali 2");

        let written = store
            .replace_all(c, &[json!({"id": "w2"}), json!({"id": "w3"}), json!({"x": 1})])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.count(c).await.unwrap(), 2);
        assert!(store.get(c, "w1").await.unwrap().is_none());

        // 空集合替换 = 清空
        assert_eq!(store.replace_all(c, &[]).await.unwrap(), 0);
        assert_eq!(store.count(c).await.unwrap(), 0);

        store.put_many(c, &[json!({"id": "a"}), json!({"id": "b"})]).await.unwrap();
        assert!(store.remove(c, "a").await.unwrap());
        assert!(!store.remove(c, "a").await.unwrap());
        assert_eq!(store.get_all(c).await.unwrap().len(), 1);

        // 其它集合互不影响
        store.put(Collection::Projects, &json!({"id": "p1"})).await.unwrap();
        store.clear(c).await.unwrap();
        assert_eq!(store.count(c).await.unwrap(), 0);
        assert_eq!(store.count(Collection::Projects).await.unwrap(), 1);

        let counts = store.collection_counts().await;
        assert_eq!(counts.len(), Collection::ALL.len());
        assert!(counts.contains(&(Collection::Projects, 1)));
    }

    #[tokio::test]
    async fn test_kv_backend_contract() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReplicaStore::for_platform(StorePlatform::Web, temp_dir.path());
        assert_eq!(store.backend_name(), "sled");
        exercise_contract(store).await;
    }

    #[tokio::test]
    async fn test_sqlite_backend_contract() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReplicaStore::for_platform(StorePlatform::Native, temp_dir.path());
        assert_eq!(store.backend_name(), "sqlite");
        exercise_contract(store).await;
    }

    #[tokio::test]
    async fn test_operations_before_initialize_fail_softly() {
        let temp_dir = TempDir::new().unwrap();
        for platform in [StorePlatform::Web, StorePlatform::Native] {
            let store = ReplicaStore::for_platform(platform, temp_dir.path());
            assert!(store.count(Collection::Workers).await.is_err());
            assert!(store.put(Collection::Workers, &json!({"id": "1"})).await.is_err());
        }
    }
}
