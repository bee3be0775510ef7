//! BinarJoin Sync - 离线优先的同步引擎
//!
//! 为工程记账客户端提供离线能力：
//! - 💾 本地副本：服务端每个集合在本地的镜像（浏览器类平台 sled，原生平台 SQLite）
//! - 📥 全量拉取：按依赖顺序拉取所有集合，单个集合失败不影响其余
//! - 📦 Outbox：直接写失败时持久化排队，恢复联网后按序重放
//! - 📡 实时失效：服务端推送变更通知，界面缓存精确失效
//! - 📁 范围切换：切换项目时只刷新受影响且正在使用的查询
//! - 📊 可观察状态：进度、在线状态、待同步数量的快照与订阅
//! - 🧹 数据维护：过期清理、新鲜度检查、JSON 备份与恢复
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use binarjoin_sync::{MemoryQueryCache, OutboxOperation, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.example.com")
//!         .push_url("wss://api.example.com/realtime")
//!         .build();
//!
//!     let engine = SyncEngine::initialize(config, None, Arc::new(MemoryQueryCache::new())).await?;
//!
//!     // 订阅同步状态
//!     let _subscription = engine.subscribe_sync_state(|state| {
//!         println!("同步状态: {}", state.summary());
//!     });
//!
//!     // 冷启动全量拉取
//!     engine.perform_initial_data_pull().await;
//!
//!     // 写操作：失败时自动保存到本地
//!     let outcome = engine
//!         .submit_write(OutboxOperation::Create, "/api/fund-transfers", serde_json::json!({"amount": 1500}))
//!         .await?;
//!     println!("写入结果: {:?}", outcome);
//!
//!     engine.start_realtime().await?;
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod collections;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http_client;
pub mod lifecycle;
pub mod logging;
pub mod maintenance;
pub mod network;
pub mod realtime;
pub mod scope;
pub mod storage;
pub mod sync;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{MemoryQueryCache, QueryCache};
pub use collections::{Collection, PULL_ORDER};
pub use config::{HttpClientConfig, PullConfig, RealtimeConfig, RetryConfig, SyncConfig, SyncConfigBuilder};
pub use engine::{SyncEngine, WriteOutcome};
pub use error::{Result, SyncError};
pub use events::{EventFilter, EventManager, SyncEvent};
pub use http_client::{ApiClient, RemoteApi};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use maintenance::{CleanupPolicy, CleanupReport, ReplicaExport, ReplicaMaintenance};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use realtime::{BridgeState, InvalidationMessage, RealtimeBridge};
pub use scope::{ProjectScope, ScopeRefresher, SCOPE_DEPENDENT_KEYS};
pub use storage::{LocalReplicaStore, ReplicaStore, StorePlatform};
pub use sync::{
    InitialPullOrchestrator, OutboxEntry, OutboxOperation, OutboxQueue, OutboxStats, ReplayReport, SyncProgress,
    SyncSnapshot, SyncStateManager, SyncStateSubscription,
};
pub use version::{REPLICA_DB_VERSION, SDK_VERSION};
