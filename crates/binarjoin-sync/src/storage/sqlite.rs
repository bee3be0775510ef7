//! 关系型副本存储 - 基于 SQLite
//!
//! 每个集合一张表 `(id, data, synced, updated_at)`，记录整体以 JSON 文本存储。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use super::{keyed_records, migrate, record_key, LocalReplicaStore};
use crate::collections::Collection;
use crate::error::{Result, SyncError};

const DB_FILE_NAME: &str = "replica.db";

#[derive(Debug)]
pub struct SqliteReplicaStore {
    /// None 表示内存库
    path: Option<PathBuf>,
    conn: OnceCell<Arc<Mutex<Connection>>>,
}

impl SqliteReplicaStore {
    pub fn new(base_path: &Path) -> Self {
        Self {
            path: Some(base_path.join(DB_FILE_NAME)),
            conn: OnceCell::new(),
        }
    }

    /// 内存库，进程退出即丢失
    pub fn in_memory() -> Self {
        Self {
            path: None,
            conn: OnceCell::new(),
        }
    }

    async fn open(path: Option<&Path>) -> Result<Arc<Mutex<Connection>>> {
        let mut conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| SyncError::StoreInit(format!("创建副本库目录失败: {}", e)))?;
                }
                Connection::open(path)
                    .map_err(|e| SyncError::StoreInit(format!("打开副本库失败: {}", e)))?
            }
            None => Connection::open_in_memory()
                .map_err(|e| SyncError::StoreInit(format!("打开内存副本库失败: {}", e)))?,
        };
        migrate::init_db(&mut conn).map_err(|e| SyncError::StoreInit(e.to_string()))?;
        Ok(Arc::new(Mutex::new(conn)))
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        self.conn
            .get()
            .cloned()
            .ok_or_else(|| SyncError::NotInitialized("副本存储尚未初始化".to_string()))
    }

    fn synced_flag(record: &Value) -> i64 {
        match record.get("synced").and_then(Value::as_bool) {
            Some(false) => 0,
            _ => 1,
        }
    }

    fn insert_sql(collection: Collection) -> String {
        format!(
            "INSERT OR REPLACE INTO \"{}\" (id, data, synced, updated_at) VALUES (?1, ?2, ?3, ?4)",
            collection.as_str()
        )
    }

    fn insert_all(
        conn: &Connection,
        collection: Collection,
        records: &[Value],
    ) -> Result<usize> {
        let mut stmt = conn.prepare_cached(&Self::insert_sql(collection))?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut written = 0;
        for (key, record) in keyed_records(collection, records) {
            let data = serde_json::to_string(record)?;
            stmt.execute(params![key, data, Self::synced_flag(record), now])?;
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait::async_trait]
impl LocalReplicaStore for SqliteReplicaStore {
    async fn initialize(&self) -> Result<()> {
        let path = self.path.clone();
        self.conn
            .get_or_try_init(|| Self::open(path.as_deref()))
            .await?;
        info!(
            "✅ SQLite 副本存储已就绪: {}",
            self.path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );
        Ok(())
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let conn = self.connection()?;
        let conn = conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT id, data FROM \"{}\" ORDER BY rowid",
            collection.as_str()
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, data) = row?;
            match serde_json::from_str(&data) {
                Ok(v) => records.push(v),
                Err(e) => warn!("⚠️ [{}] 记录 {} 反序列化失败，已跳过: {}", collection, id, e),
            }
        }
        Ok(records)
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        let conn = self.connection()?;
        let conn = conn.lock().await;
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM \"{}\" WHERE id = ?1", collection.as_str()),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, collection: Collection, record: &Value) -> Result<bool> {
        let Some(key) = record_key(record) else {
            warn!("⚠️ [{}] 记录缺少 id/key，未写入", collection);
            return Ok(false);
        };
        let data = serde_json::to_string(record)?;
        let conn = self.connection()?;
        let conn = conn.lock().await;
        conn.execute(
            &Self::insert_sql(collection),
            params![key, data, Self::synced_flag(record), chrono::Utc::now().timestamp_millis()],
        )
        .map_err(|e| SyncError::Database(format!("写入 {}/{} 失败: {}", collection, key, e)))?;
        Ok(true)
    }

    async fn put_many(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        let conn = self.connection()?;
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        let written = Self::insert_all(&tx, collection, records)?;
        tx.commit()
            .map_err(|e| SyncError::Database(format!("批量写入 {} 失败: {}", collection, e)))?;
        Ok(written)
    }

    async fn replace_all(&self, collection: Collection, records: &[Value]) -> Result<usize> {
        let conn = self.connection()?;
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM \"{}\"", collection.as_str()), [])?;
        let written = Self::insert_all(&tx, collection, records)?;
        tx.commit()
            .map_err(|e| SyncError::Database(format!("替换集合 {} 失败: {}", collection, e)))?;
        Ok(written)
    }

    async fn remove(&self, collection: Collection, key: &str) -> Result<bool> {
        let conn = self.connection()?;
        let conn = conn.lock().await;
        let changed = conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?1", collection.as_str()),
            [key],
        )?;
        Ok(changed > 0)
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        let conn = self.connection()?;
        let conn = conn.lock().await;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", collection.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        let conn = self.connection()?;
        let conn = conn.lock().await;
        conn.execute(&format!("DELETE FROM \"{}\"", collection.as_str()), [])
            .map_err(|e| SyncError::Database(format!("清空集合 {} 失败: {}", collection, e)))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unsynced_flag_is_stored() {
        let store = SqliteReplicaStore::in_memory();
        store.initialize().await.unwrap();
        store
            .put(Collection::FundTransfers, &json!({"id": "f1", "synced": false}))
            .await
            .unwrap();

        let conn = store.connection().unwrap();
        let conn = conn.lock().await;
        let synced: i64 = conn
            .query_row("SELECT synced FROM \"fundTransfers\" WHERE id='f1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(synced, 0);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SqliteReplicaStore::new(temp_dir.path());
            store.initialize().await.unwrap();
            store
                .put_many(Collection::Projects, &[json!({"id": 1}), json!({"id": 2})])
                .await
                .unwrap();
        }
        let store = SqliteReplicaStore::new(temp_dir.path());
        store.initialize().await.unwrap();
        assert_eq!(store.count(Collection::Projects).await.unwrap(), 2);
        assert!(store.get(Collection::Projects, "2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_initialize_fails_fatally_on_unusable_path() {
        let temp_dir = TempDir::new().unwrap();
        // 用普通文件占住目录位置
        let blocker = temp_dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();

        let store = SqliteReplicaStore::new(&blocker.join("nested"));
        assert!(matches!(store.initialize().await, Err(SyncError::StoreInit(_))));
    }
}
