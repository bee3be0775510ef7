//! 文档型副本存储 - 基于 sled
//!
//! 每个集合一棵 tree，key 为记录主键，value 为记录 JSON。
//! `replace_all` 在单个 sled 事务中完成删除与写入，读者不会看到半替换的集合。

use std::path::{Path, PathBuf};

use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{keyed_records, record_key, LocalReplicaStore};
use crate::collections::Collection;
use crate::error::{Result, SyncError};

const MAX_OPEN_RETRIES: u32 = 8;
const RETRY_DELAY_MS: u64 = 300;

#[derive(Debug)]
pub struct KvReplicaStore {
    path: PathBuf,
    db: OnceCell<Db>,
}

impl KvReplicaStore {
    pub fn new(base_path: &Path) -> Self {
        Self {
            path: base_path.join("replica-kv"),
            db: OnceCell::new(),
        }
    }

    /// 打开 sled（上一个实例可能刚释放文件锁，遇锁冲突带退避重试）
    async fn open_db(path: &Path) -> Result<Db> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| SyncError::StoreInit(format!("创建副本存储目录失败: {}", e)))?;

        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(path) {
                Ok(db) => return Ok(db),
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        debug!("sled 文件锁被占用，{}ms 后重试 ({}/{})", delay_ms, attempt + 1, MAX_OPEN_RETRIES);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        Err(SyncError::StoreInit(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    fn tree(&self, collection: Collection) -> Result<Tree> {
        let db = self
            .db
            .get()
            .ok_or_else(|| SyncError::NotInitialized("副本存储尚未初始化".to_string()))?;
        db.open_tree(collection.as_str())
            .map_err(|e| SyncError::KvStore(format!("打开集合 {} 失败: {}", collection, e)))
    }

    async fn flush(tree: &Tree, collection: Collection) -> Result<()> {
        tree.flush_async()
            .await
            .map_err(|e| SyncError::KvStore(format!("刷盘集合 {} 失败: {}", collection, e)))?;
        Ok(())
    }

    fn decode(collection: Collection, key: &[u8], bytes: &[u8]) -> Option<Value> {
        match serde_json::from_slice(bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "⚠️ [{}] 记录 {} 反序列化失败，已跳过: {}",
                    collection,
                    String::from_utf8_lossy(key),
                    e
                );
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl LocalReplicaStore for KvReplicaStore {
    async fn initialize(&self) -> Result<()> {
        let path = self.path.clone();
        let db = self.db.get_or_try_init(|| Self::open_db(&path)).await?;

        // 为每个集合建 tree（幂等）
        for &collection in Collection::ALL {
            db.open_tree(collection.as_str()).map_err(|e| {
                SyncError::StoreInit(format!("创建集合 {} 失败: {}", collection, e))
            })?;
        }
        info!("✅ sled 副本存储已就绪: {}", self.path.display());
        Ok(())
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let tree = self.tree(collection)?;
        let mut records = Vec::new();
        for item in tree.iter() {
            let (key, bytes) =
                item.map_err(|e| SyncError::KvStore(format!("遍历集合 {} 失败: {}", collection, e)))?;
            if let Some(value) = Self::decode(collection, &key, &bytes) {
                records.push(value);
            }
        }
        Ok(records)
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        let tree = self.tree(collection)?;
        let bytes = tree
            .get(key.as_bytes())
            .map_err(|e| SyncError::KvStore(format!("读取 {}/{} 失败: {}", collection, key, e)))?;
        Ok(bytes.and_then(|b| Self::decode(collection, key.as_bytes(), &b)))
    }

    async fn put(&self, collection: Collection, record: &Value) -> Result<bool> {
        let Some(key) = record_key(record) else {
            warn!("⚠️ [{}] 记录缺少 id/key，未写入", collection);
            return Ok(false);
        };
        let tree = self.tree(collection)?;
        let bytes = serde_json::to_vec(record)?;
        tree.insert(key.as_bytes(), bytes)
            .map_err(|e| SyncError::KvStore(format!("写入 {}/{} 失败: {}", collection, key, e)))?;
        Self::flush(&tree, collection).await?;
        Ok(true)
    }

    async fn put_many(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        let tree = self.tree(collection)?;
        let mut batch = sled::Batch::default();
        let mut written = 0;
        for (key, record) in keyed_records(collection, records) {
            batch.insert(key.as_bytes(), serde_json::to_vec(record)?);
            written += 1;
        }
        tree.apply_batch(batch)
            .map_err(|e| SyncError::KvStore(format!("批量写入 {} 失败: {}", collection, e)))?;
        Self::flush(&tree, collection).await?;
        Ok(written)
    }

    async fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        let tree = self.tree(collection)?;

        let mut incoming = Vec::with_capacity(records.len());
        for (key, record) in keyed_records(collection, records) {
            incoming.push((key, serde_json::to_vec(record)?));
        }
        let existing: Vec<sled::IVec> = tree
            .iter()
            .keys()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SyncError::KvStore(format!("遍历集合 {} 失败: {}", collection, e)))?;

        tree.transaction(|tx| {
            for key in &existing {
                tx.remove(key.clone())?;
            }
            for (key, bytes) in &incoming {
                tx.insert(key.as_bytes(), bytes.as_slice())?;
            }
            Ok::<(), ConflictableTransactionError<()>>(())
        })
        .map_err(|e: TransactionError<()>| {
            SyncError::KvStore(format!("替换集合 {} 失败: {:?}", collection, e))
        })?;

        Self::flush(&tree, collection).await?;
        debug!("[{}] 已替换 {} 条记录", collection, incoming.len());
        Ok(incoming.len())
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<bool> {
        let tree = self.tree(collection)?;
        let removed = tree
            .remove(key.as_bytes())
            .map_err(|e| SyncError::KvStore(format!("删除 {}/{} 失败: {}", collection, key, e)))?;
        Self::flush(&tree, collection).await?;
        Ok(removed.is_some())
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        Ok(self.tree(collection)?.len())
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        let tree = self.tree(collection)?;
        tree.clear()
            .map_err(|e| SyncError::KvStore(format!("清空集合 {} 失败: {}", collection, e)))?;
        Self::flush(&tree, collection).await
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
