use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 网络受限（仍可尝试请求）
    Limited,
}

impl NetworkStatus {
    pub fn is_reachable(self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

impl NetworkStatusEvent {
    /// 离线 → 可达
    pub fn came_online(&self) -> bool {
        !self.old_status.is_reachable() && self.new_status.is_reachable()
    }

    pub fn went_offline(&self) -> bool {
        self.old_status.is_reachable() && !self.new_status.is_reachable()
    }
}

/// 网络状态监听器 trait（由宿主平台实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
    forward_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Online)),
            forward_task: parking_lot::Mutex::new(None),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        self.set_status(initial).await;

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                {
                    let mut status = current_status.write().await;
                    if *status == event.new_status {
                        continue;
                    }
                    *status = event.new_status;
                }
                debug!("🌐 网络状态: {:?} → {:?}", event.old_status, event.new_status);
                let _ = status_sender.send(event);
            }
        });
        if let Some(old) = self.forward_task.lock().replace(task) {
            old.abort();
        }
        info!("✅ 网络监控已启动 (当前: {:?})", initial);
        Ok(())
    }

    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态（例如请求层探测到断网）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status)
        };
        if old_status == new_status {
            return;
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 检查网络连接（通过网络状态判断）
    pub async fn check_connection(&self) -> bool {
        self.get_status().await.is_reachable()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.forward_task.get_mut().take() {
            task.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::ManualNetworkListener;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_monitor_forwards_changes() {
        let listener = ManualNetworkListener::new(NetworkStatus::Offline);
        let monitor = NetworkMonitor::new(listener.clone());
        let mut rx = monitor.subscribe();
        monitor.start().await.unwrap();
        assert!(!monitor.check_connection().await);

        // start() 自身把初始状态 Online → Offline 广播了一次
        let initial = rx.recv().await.unwrap();
        assert!(initial.went_offline());

        listener.switch(NetworkStatus::Online);
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(event.came_online());
        assert!(monitor.check_connection().await);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_set_status_is_deduplicated() {
        let monitor = NetworkMonitor::new(ManualNetworkListener::new(NetworkStatus::Online));
        let mut rx = monitor.subscribe();
        monitor.set_status(NetworkStatus::Online).await;
        monitor.set_status(NetworkStatus::Limited).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.new_status, NetworkStatus::Limited);
        assert!(!event.came_online());
        assert!(rx.try_recv().is_err());
    }
}
