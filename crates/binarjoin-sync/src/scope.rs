//! 项目范围切换刷新
//!
//! 切换当前项目（或「全部项目」）时：
//! 1. 取消进行中的缓存请求
//! 2. 前缀失效所有依赖项目范围的查询 key
//! 3. 选中具体项目时，再失效任何包含该项目 ID 的查询
//! 4. 只让当前活跃的查询重新获取
//!
//! 选中的范围保存在 `syncMetadata` 的 `selectedProject` 记录中，重启后由 `restore()` 恢复。

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::cache::QueryCache;
use crate::collections::Collection;
use crate::error::Result;
use crate::events::{now_millis, EventManager, SyncEvent};
use crate::storage::LocalReplicaStore;

/// `syncMetadata` 中保存当前范围的 key
pub const SELECTED_PROJECT_KEY: &str = "selectedProject";

/// 表示「全部项目」的取值
pub const ALL_PROJECTS_ID: &str = "all";

/// 按项目参数化的查询 key（前缀）
pub const SCOPE_DEPENDENT_KEYS: &[&str] = &[
    "/api/projects",
    "/api/projects/with-stats",
    "/api/workers",
    "/api/worker-attendance",
    "/api/material-purchases",
    "/api/fund-transfers",
    "/api/transportation-expenses",
    "/api/worker-transfers",
    "/api/worker-misc-expenses",
    "/api/suppliers",
    "/api/daily-expense-summaries",
    "/api/materials",
    "/api/notifications",
];

/// 当前项目范围
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProjectScope {
    #[default]
    All,
    Project(String),
}

impl ProjectScope {
    pub fn is_all(&self) -> bool {
        matches!(self, ProjectScope::All)
    }

    /// 请求 API 时使用的项目 ID；全部项目时为 None
    pub fn project_id(&self) -> Option<&str> {
        match self {
            ProjectScope::All => None,
            ProjectScope::Project(id) => Some(id),
        }
    }
}

impl From<String> for ProjectScope {
    fn from(value: String) -> Self {
        match value.trim() {
            "" | ALL_PROJECTS_ID | "undefined" | "null" => ProjectScope::All,
            id => ProjectScope::Project(id.to_string()),
        }
    }
}

impl From<&str> for ProjectScope {
    fn from(value: &str) -> Self {
        ProjectScope::from(value.to_string())
    }
}

impl From<ProjectScope> for String {
    fn from(scope: ProjectScope) -> Self {
        match scope {
            ProjectScope::All => ALL_PROJECTS_ID.to_string(),
            ProjectScope::Project(id) => id,
        }
    }
}

impl std::fmt::Display for ProjectScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectScope::All => f.write_str(ALL_PROJECTS_ID),
            ProjectScope::Project(id) => f.write_str(id),
        }
    }
}

/// 一次范围切换的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRefreshReport {
    /// 按固定 key 失效的查询数
    pub invalidated: usize,
    /// 因包含项目 ID 而失效的查询数
    pub matched_by_id: usize,
}

pub struct ScopeRefresher {
    cache: Arc<dyn QueryCache>,
    store: Arc<dyn LocalReplicaStore>,
    events: Arc<EventManager>,
    current: RwLock<ProjectScope>,
}

impl ScopeRefresher {
    pub fn new(cache: Arc<dyn QueryCache>, store: Arc<dyn LocalReplicaStore>, events: Arc<EventManager>) -> Self {
        Self {
            cache,
            store,
            events,
            current: RwLock::new(ProjectScope::All),
        }
    }

    pub fn current(&self) -> ProjectScope {
        self.current.read().clone()
    }

    /// 从本地元数据恢复上次选中的范围；没有记录或记录损坏时为「全部项目」
    pub async fn restore(&self) -> ProjectScope {
        let scope = match self.store.get(Collection::SyncMetadata, SELECTED_PROJECT_KEY).await {
            Ok(Some(record)) => record
                .get("scope")
                .and_then(|v| v.as_str())
                .map(ProjectScope::from)
                .unwrap_or_default(),
            Ok(None) => ProjectScope::All,
            Err(e) => {
                warn!("⚠️ 读取已保存的项目范围失败: {}", e);
                ProjectScope::All
            }
        };
        *self.current.write() = scope.clone();
        scope
    }

    /// 切换范围并刷新依赖该范围的查询
    pub async fn change_scope(&self, scope: ProjectScope) -> Result<ScopeRefreshReport> {
        info!("📁 切换项目范围: {} → {}", self.current(), scope);
        *self.current.write() = scope.clone();
        if let Err(e) = self.persist(&scope).await {
            warn!("⚠️ 保存项目范围失败: {}", e);
        }

        let report = self.refresh_for(&scope).await;
        self.events
            .emit(SyncEvent::ScopeChanged {
                scope,
                timestamp: now_millis(),
            })
            .await;
        Ok(report)
    }

    /// 以当前范围重新刷新（用户下拉刷新）
    pub async fn refresh(&self) -> ScopeRefreshReport {
        let scope = self.current();
        self.refresh_for(&scope).await
    }

    async fn refresh_for(&self, scope: &ProjectScope) -> ScopeRefreshReport {
        let started = std::time::Instant::now();
        self.cache.cancel_in_flight().await;

        let mut report = ScopeRefreshReport::default();
        for key in SCOPE_DEPENDENT_KEYS {
            report.invalidated += self.cache.invalidate(&[key.to_string()], false).await;
        }
        if let Some(id) = scope.project_id() {
            let id = id.to_string();
            report.matched_by_id = self
                .cache
                .invalidate_where(&move |key: &[String]| key.iter().any(|part| *part == id))
                .await;
        }

        self.cache.refetch_active().await;
        info!(
            "✅ 范围刷新完成: 失效 {} 个查询，按项目匹配 {} 个，用时 {}ms",
            report.invalidated,
            report.matched_by_id,
            started.elapsed().as_millis()
        );
        report
    }

    async fn persist(&self, scope: &ProjectScope) -> Result<()> {
        let record = json!({
            "key": SELECTED_PROJECT_KEY,
            "scope": scope.to_string(),
            "updatedAt": chrono::Utc::now().timestamp_millis(),
        });
        self.store.put(Collection::SyncMetadata, &record).await?;
        Ok(())
    }
}
