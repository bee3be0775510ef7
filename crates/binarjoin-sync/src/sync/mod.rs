//! 同步模块
//!
//! - `state`：可观察的同步状态
//! - `pull`：全量拉取编排
//! - `outbox`：离线写操作队列与重放
//! - `retry_policy`：重放退避策略

pub mod outbox;
pub mod pull;
pub mod retry_policy;
pub mod state;

pub use outbox::{EntryStatus, OutboxEntry, OutboxOperation, OutboxQueue, OutboxStats, ReplayReport};
pub use pull::{InitialPullOrchestrator, LastSyncInfo, LAST_SYNC_KEY};
pub use retry_policy::{ReplayFailureReason, RetryPolicy};
pub use state::{SyncProgress, SyncSnapshot, SyncStateManager, SyncStateSubscription};
