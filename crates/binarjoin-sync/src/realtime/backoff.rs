use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::RealtimeConfig;

/// 推送通道重连退避
///
/// 1. 指数退避：1s → 2s → 4s → 5s 封顶（默认）
/// 2. 连续失败达到上限后放弃，停在 Disconnected
/// 3. 连接成功后计数清零
#[derive(Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
    current_interval: RwLock<Duration>,
    attempts: RwLock<u32>,
}

impl ReconnectBackoff {
    pub fn new(config: &RealtimeConfig) -> Self {
        let initial = Duration::from_millis(config.reconnect_initial_ms);
        Self {
            initial,
            max: Duration::from_millis(config.reconnect_max_ms.max(config.reconnect_initial_ms)),
            multiplier: config.reconnect_multiplier.max(1.0),
            max_attempts: config.max_reconnect_attempts,
            current_interval: RwLock::new(initial),
            attempts: RwLock::new(0),
        }
    }

    /// 下一次重连前的等待时间；超过最大次数返回 None
    pub fn next_delay(&self) -> Option<Duration> {
        let mut attempts = self.attempts.write();
        if *attempts >= self.max_attempts {
            info!("🛑 重连已达上限 {} 次，停止自动重连", self.max_attempts);
            return None;
        }
        *attempts += 1;

        let mut current = self.current_interval.write();
        let delay = *current;
        *current = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier).min(self.max);
        debug!("重连尝试 #{}, 等待 {}ms", *attempts, delay.as_millis());
        Some(delay)
    }

    /// 标记连接成功
    pub fn mark_success(&self) {
        let attempts = *self.attempts.read();
        if attempts > 0 {
            info!("连接成功！重置重连计数器（之前尝试了 {} 次）", attempts);
        }
        *self.attempts.write() = 0;
        *self.current_interval.write() = self.initial;
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.read()
    }
}
