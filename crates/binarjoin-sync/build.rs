//! 编译期生成 REPLICA_DB_VERSION（从 migrations/ 目录扫描 V{version}__*.sql 取最大版本号，供 version.rs 使用）

use std::env;
use std::fs;
use std::path::Path;

/// refinery 文件名格式: V{version}__{name}.sql
fn parse_migration_version(file_name: &str) -> Option<i64> {
    let rest = file_name.strip_prefix('V')?.strip_suffix(".sql")?;
    rest.split("__").next()?.parse::<i64>().ok()
}

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let migrations_dir = Path::new(&manifest_dir).join("migrations");

    let max_version = fs::read_dir(&migrations_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str().and_then(parse_migration_version))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    println!("cargo:rustc-env=REPLICA_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}
