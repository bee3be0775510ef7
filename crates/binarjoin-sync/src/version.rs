//! 版本元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Replica DB Version** → migrations 文件（文件即版本，由 refinery 管理）

/// 库 semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 当前库支持的最高 SQLite 副本库 migration 版本。
/// 由 build.rs 扫描 migrations/ 下 V{version}__*.sql 生成；打开更高版本的库会被拒绝。
pub const REPLICA_DB_VERSION: i64 = parse_db_version(env!("REPLICA_DB_VERSION"));

/// 写入 syncMetadata 的副本格式版本
pub const REPLICA_FORMAT_VERSION: u32 = 1;

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i].is_ascii_digit() {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_version_matches_migrations() {
        assert!(REPLICA_DB_VERSION >= 1);
        assert_eq!(parse_db_version("12"), 12);
        assert!(!SDK_VERSION.is_empty());
    }
}
