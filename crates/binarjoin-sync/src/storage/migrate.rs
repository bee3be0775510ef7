//! SQLite 副本库迁移与初始化 - 由 refinery 管理
//!
//! 统一入口 `init_db`：pragmas → migrate → 版本校验。
//! 新增集合只需在 migrations/ 添加 V{n}__{name}.sql，编译期自动嵌入、启动时自动执行。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;

use crate::error::{Result, SyncError};
use crate::version::REPLICA_DB_VERSION;

/// refinery 默认的 migration 历史表
const REFINERY_TABLE: &str = "refinery_schema_history";

/// 副本库 PRAGMA：WAL、NORMAL 同步、内存临时表
const REPLICA_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(REPLICA_PRAGMAS.trim())
        .map_err(|e| SyncError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| SyncError::Database(format!("执行 migration 失败: {}", e)))?;
    Ok(())
}

/// 当前库的 migration 版本；无历史表或空表返回 None
pub fn get_db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| SyncError::Database(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| SyncError::Database(format!("读取 migration 版本失败: {}", e)))?;

    Ok(version.filter(|&v| v > 0))
}

/// 库版本高于本库支持的最高版本时拒绝打开（降级后 schema 不兼容）
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = get_db_migration_version(conn)? else {
        return Ok(());
    };
    if v > REPLICA_DB_VERSION {
        return Err(SyncError::Database(format!(
            "副本库版本 {} 高于当前支持的最高版本 {}，请升级后再打开",
            v, REPLICA_DB_VERSION
        )));
    }
    Ok(())
}

pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    check_db_version(conn)?;
    run_migrations(conn)?;
    Ok(())
}
