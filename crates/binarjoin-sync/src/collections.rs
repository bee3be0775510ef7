//! 副本集合枚举 - 本地镜像的固定表集合
//!
//! 集合集合在编译期固定，所有平台（sled / SQLite）镜像完全相同的一组集合。
//! 新增集合需同时在 `migrations/` 中添加对应的表。

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 本地副本中的一个逻辑表
///
/// 序列化为存储名（与 [`Collection::as_str`] 一致）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Users,
    ProjectTypes,
    Projects,
    WorkerTypes,
    Workers,
    Suppliers,
    MaterialCategories,
    Materials,
    Wells,
    FundTransfers,
    ProjectFundTransfers,
    WorkerAttendance,
    MaterialPurchases,
    SupplierPayments,
    TransportationExpenses,
    WorkerTransfers,
    WorkerMiscExpenses,
    WorkerBalances,
    DailyExpenseSummaries,
    Notifications,
    /// 保留集合：outbox 条目
    SyncQueue,
    /// 保留集合：同步元信息（以 `key` 为主键）
    SyncMetadata,
}

/// 全量拉取顺序（按引用依赖，不按字母序）
///
/// users → 项目/工人/供应商等主数据 → 引用主数据的流水表 → 汇总与通知。
/// 例如 workerAttendance 引用 project 与 worker，必须排在两者之后。
pub const PULL_ORDER: &[Collection] = &[
    Collection::Users,
    Collection::ProjectTypes,
    Collection::Projects,
    Collection::WorkerTypes,
    Collection::Workers,
    Collection::Suppliers,
    Collection::MaterialCategories,
    Collection::Materials,
    Collection::Wells,
    Collection::FundTransfers,
    Collection::ProjectFundTransfers,
    Collection::WorkerAttendance,
    Collection::MaterialPurchases,
    Collection::SupplierPayments,
    Collection::TransportationExpenses,
    Collection::WorkerTransfers,
    Collection::WorkerMiscExpenses,
    Collection::WorkerBalances,
    Collection::DailyExpenseSummaries,
    Collection::Notifications,
];

impl Collection {
    /// 所有集合（含保留集合），诊断页按此顺序枚举
    pub const ALL: &'static [Collection] = &[
        Collection::Users,
        Collection::ProjectTypes,
        Collection::Projects,
        Collection::WorkerTypes,
        Collection::Workers,
        Collection::Suppliers,
        Collection::MaterialCategories,
        Collection::Materials,
        Collection::Wells,
        Collection::FundTransfers,
        Collection::ProjectFundTransfers,
        Collection::WorkerAttendance,
        Collection::MaterialPurchases,
        Collection::SupplierPayments,
        Collection::TransportationExpenses,
        Collection::WorkerTransfers,
        Collection::WorkerMiscExpenses,
        Collection::WorkerBalances,
        Collection::DailyExpenseSummaries,
        Collection::Notifications,
        Collection::SyncQueue,
        Collection::SyncMetadata,
    ];

    /// 本地存储名（sled tree 名 / SQLite 表名）
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::ProjectTypes => "projectTypes",
            Self::Projects => "projects",
            Self::WorkerTypes => "workerTypes",
            Self::Workers => "workers",
            Self::Suppliers => "suppliers",
            Self::MaterialCategories => "materialCategories",
            Self::Materials => "materials",
            Self::Wells => "wells",
            Self::FundTransfers => "fundTransfers",
            Self::ProjectFundTransfers => "projectFundTransfers",
            Self::WorkerAttendance => "workerAttendance",
            Self::MaterialPurchases => "materialPurchases",
            Self::SupplierPayments => "supplierPayments",
            Self::TransportationExpenses => "transportationExpenses",
            Self::WorkerTransfers => "workerTransfers",
            Self::WorkerMiscExpenses => "workerMiscExpenses",
            Self::WorkerBalances => "workerBalances",
            Self::DailyExpenseSummaries => "dailyExpenseSummaries",
            Self::Notifications => "notifications",
            Self::SyncQueue => "syncQueue",
            Self::SyncMetadata => "syncMetadata",
        }
    }

    /// 远端 REST 路径段（`/api/<segment>`），保留集合没有远端对应
    pub fn api_segment(self) -> Option<&'static str> {
        let segment = match self {
            Self::Users => "users",
            Self::ProjectTypes => "project-types",
            Self::Projects => "projects",
            Self::WorkerTypes => "worker-types",
            Self::Workers => "workers",
            Self::Suppliers => "suppliers",
            Self::MaterialCategories => "material-categories",
            Self::Materials => "materials",
            Self::Wells => "wells",
            Self::FundTransfers => "fund-transfers",
            Self::ProjectFundTransfers => "project-fund-transfers",
            Self::WorkerAttendance => "worker-attendance",
            Self::MaterialPurchases => "material-purchases",
            Self::SupplierPayments => "supplier-payments",
            Self::TransportationExpenses => "transportation-expenses",
            Self::WorkerTransfers => "worker-transfers",
            Self::WorkerMiscExpenses => "worker-misc-expenses",
            Self::WorkerBalances => "worker-balances",
            Self::DailyExpenseSummaries => "daily-expense-summaries",
            Self::Notifications => "notifications",
            Self::SyncQueue | Self::SyncMetadata => return None,
        };
        Some(segment)
    }

    /// 完整拉取路径，如 `/api/fund-transfers`
    pub fn endpoint(self) -> Option<String> {
        self.api_segment().map(|s| format!("/api/{}", s))
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::SyncQueue | Self::SyncMetadata)
    }

    /// 记录主键字段名
    pub fn key_field(self) -> &'static str {
        match self {
            Self::SyncMetadata => "key",
            _ => "id",
        }
    }

    /// 由写请求的 endpoint 反查目标集合（`/api/fund-transfers/42` → FundTransfers）
    ///
    /// 同时接受 kebab-case 路径段与存储名。
    pub fn from_endpoint(endpoint: &str) -> Option<Collection> {
        let family = resource_family(endpoint);
        PULL_ORDER
            .iter()
            .copied()
            .find(|c| c.api_segment() == Some(family.as_str()) || c.as_str() == family)
    }
}

/// endpoint 的资源族：`/api/<segment>/...` 中的 `<segment>`，去掉查询串
///
/// outbox 以资源族为单位保持 FIFO。
pub fn resource_family(endpoint: &str) -> String {
    let path = endpoint.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match segments.next() {
        Some("api") => segments.next().unwrap_or_default().to_string(),
        Some(first) => first.to_string(),
        None => String::new(),
    }
}

impl FromStr for Collection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s || c.api_segment() == Some(s))
            .ok_or(())
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
