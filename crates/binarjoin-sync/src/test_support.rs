//! 测试辅助：内存版远端 API 与脚本化推送传输
//!
//! 行为近似真实服务端：成功的写请求会落到对应集合，后续拉取能看到。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::collections::Collection;
use crate::error::{Result, SyncError};
use crate::http_client::RemoteApi;
use crate::realtime::{PushConnection, PushTransport};
use crate::storage::{record_key, LocalReplicaStore, ReplicaStore, StorePlatform};
use crate::sync::outbox::OutboxOperation;

#[derive(Debug, Clone, Copy)]
pub(crate) enum MockFailure {
    Network,
    Timeout,
    Http(u16),
}

impl MockFailure {
    fn to_error(self) -> SyncError {
        match self {
            MockFailure::Network => SyncError::Network("connection refused".into()),
            MockFailure::Timeout => SyncError::Timeout("request timed out".into()),
            MockFailure::Http(status) => SyncError::Http {
                status,
                message: format!("status {}", status),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SentWrite {
    pub operation: OutboxOperation,
    pub endpoint: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
pub(crate) struct MockRemoteApi {
    data: Mutex<HashMap<Collection, Vec<Value>>>,
    fetch_failures: Mutex<HashMap<Collection, MockFailure>>,
    fetch_delays: Mutex<HashMap<Collection, Duration>>,
    fetch_log: Mutex<Vec<Collection>>,
    write_failures: Mutex<VecDeque<MockFailure>>,
    write_log: Mutex<Vec<SentWrite>>,
    offline: AtomicBool,
    next_id: AtomicU64,
}

impl MockRemoteApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_collection(&self, collection: Collection, records: Vec<Value>) {
        self.data.lock().insert(collection, records);
    }

    pub fn records(&self, collection: Collection) -> Vec<Value> {
        self.data.lock().get(&collection).cloned().unwrap_or_default()
    }

    pub fn fail_fetch(&self, collection: Collection, failure: MockFailure) {
        self.fetch_failures.lock().insert(collection, failure);
    }

    pub fn delay_fetch(&self, collection: Collection, delay: Duration) {
        self.fetch_delays.lock().insert(collection, delay);
    }

    /// 接下来的写请求依次以这些原因失败
    pub fn fail_next_writes(&self, failures: impl IntoIterator<Item = MockFailure>) {
        self.write_failures.lock().extend(failures);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fetch_log(&self) -> Vec<Collection> {
        self.fetch_log.lock().clone()
    }

    pub fn write_log(&self) -> Vec<SentWrite> {
        self.write_log.lock().clone()
    }

    fn apply_write(&self, operation: OutboxOperation, endpoint: &str, payload: &Value) -> Option<Value> {
        let collection = Collection::from_endpoint(endpoint)?;
        let mut data = self.data.lock();
        let records = data.entry(collection).or_default();
        let path_id = endpoint
            .split('?')
            .next()
            .and_then(|p| p.trim_end_matches('/').rsplit('/').next())
            .map(str::to_string);

        match operation {
            OutboxOperation::Create => {
                let mut record = payload.clone();
                if record_key(&record).is_none() {
                    let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                    record["id"] = json!(id);
                }
                records.push(record.clone());
                Some(record)
            }
            OutboxOperation::Update => {
                let key = record_key(payload).or(path_id)?;
                let existing = records.iter_mut().find(|r| record_key(r).as_deref() == Some(key.as_str()))?;
                if let (Some(target), Some(patch)) = (existing.as_object_mut(), payload.as_object()) {
                    for (k, v) in patch {
                        target.insert(k.clone(), v.clone());
                    }
                }
                Some(existing.clone())
            }
            OutboxOperation::Delete => {
                let key = record_key(payload).or(path_id)?;
                records.retain(|r| record_key(r).as_deref() != Some(key.as_str()));
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteApi for MockRemoteApi {
    async fn fetch_collection(&self, collection: Collection) -> Result<Vec<Value>> {
        self.fetch_log.lock().push(collection);
        let delay = self.fetch_delays.lock().get(&collection).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(MockFailure::Network.to_error());
        }
        if let Some(failure) = self.fetch_failures.lock().get(&collection).copied() {
            return Err(failure.to_error());
        }
        Ok(self.records(collection))
    }

    async fn send(
        &self,
        operation: OutboxOperation,
        endpoint: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<Option<Value>> {
        self.write_log.lock().push(SentWrite {
            operation,
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        });
        if self.offline.load(Ordering::SeqCst) {
            return Err(MockFailure::Network.to_error());
        }
        if let Some(failure) = self.write_failures.lock().pop_front() {
            return Err(failure.to_error());
        }
        Ok(self.apply_write(operation, endpoint, payload))
    }
}

/// 已初始化的 sled 副本存储
pub(crate) async fn kv_store(dir: &std::path::Path) -> Arc<ReplicaStore> {
    let store = ReplicaStore::for_platform(StorePlatform::Web, dir);
    store.initialize().await.unwrap();
    Arc::new(store)
}

/// 脚本化推送连接的一次会话
#[derive(Debug, Clone)]
pub(crate) struct ScriptedSession {
    messages: Vec<String>,
    /// 消息发完后保持连接（否则模拟断线）
    hang: bool,
}

impl ScriptedSession {
    pub fn deliver_then_drop(messages: &[&str]) -> Self {
        Self {
            messages: messages.iter().map(|m| m.to_string()).collect(),
            hang: false,
        }
    }

    pub fn deliver_then_hang(messages: &[&str]) -> Self {
        Self {
            messages: messages.iter().map(|m| m.to_string()).collect(),
            hang: true,
        }
    }
}

/// 按脚本依次接受连接；脚本用完后拒绝连接
pub(crate) struct ScriptedTransport {
    sessions: Mutex<VecDeque<ScriptedSession>>,
    connects: std::sync::atomic::AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(sessions: Vec<ScriptedSession>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            connects: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PushTransport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = self.sessions.lock().pop_front();
        match session {
            Some(session) => Ok(Box::new(ScriptedConnection {
                messages: session.messages.into(),
                hang: session.hang,
            })),
            None => Err(SyncError::ChannelDropped("connection refused".into())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedConnection {
    messages: VecDeque<String>,
    hang: bool,
}

#[async_trait::async_trait]
impl PushConnection for ScriptedConnection {
    async fn next_message(&mut self) -> Result<Option<String>> {
        if let Some(message) = self.messages.pop_front() {
            return Ok(Some(message));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        Err(SyncError::ChannelDropped("scripted drop".into()))
    }

    async fn close(&mut self) {}
}
