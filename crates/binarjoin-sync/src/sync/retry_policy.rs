use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::SyncError;

/// 重放失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplayFailureReason {
    /// 请求超时 - 可重试
    Timeout,
    /// 网络不可用 - 等待恢复后重试
    Network,
    /// 服务端 5xx - 可重试
    Server(u16),
    /// 认证失败（401）- token 刷新后可重试
    AuthFailure,
    /// 限流（429）- 延迟重试
    RateLimited,
    /// 请求被服务端拒绝（其它 4xx）- 原样重放不会成功，不重试
    Rejected(u16),
    /// 未知错误 - 保守重试
    Unknown(String),
}

impl ReplayFailureReason {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplayFailureReason::Timeout
            | ReplayFailureReason::Network
            | ReplayFailureReason::AuthFailure
            | ReplayFailureReason::RateLimited
            | ReplayFailureReason::Unknown(_) => true,
            ReplayFailureReason::Server(code) => (500..600).contains(code),
            ReplayFailureReason::Rejected(_) => false,
        }
    }

    pub fn get_delay_multiplier(&self) -> f64 {
        match self {
            ReplayFailureReason::RateLimited => 2.0,
            _ => 1.0,
        }
    }

    /// 简短分类名，写入 outbox 条目供诊断页展示
    pub fn kind(&self) -> &'static str {
        match self {
            ReplayFailureReason::Timeout => "timeout",
            ReplayFailureReason::Network => "network",
            ReplayFailureReason::Server(_) => "server",
            ReplayFailureReason::AuthFailure => "auth",
            ReplayFailureReason::RateLimited => "rate_limited",
            ReplayFailureReason::Rejected(_) => "validation",
            ReplayFailureReason::Unknown(_) => "unknown",
        }
    }
}

impl From<&SyncError> for ReplayFailureReason {
    fn from(error: &SyncError) -> Self {
        match error {
            SyncError::Timeout(_) => ReplayFailureReason::Timeout,
            SyncError::Network(_) | SyncError::ChannelDropped(_) => ReplayFailureReason::Network,
            SyncError::Http { status, .. } => match *status {
                401 => ReplayFailureReason::AuthFailure,
                408 => ReplayFailureReason::Timeout,
                429 => ReplayFailureReason::RateLimited,
                s if s >= 500 => ReplayFailureReason::Server(s),
                s => ReplayFailureReason::Rejected(s),
            },
            SyncError::ServerError(_) => ReplayFailureReason::Server(500),
            other => ReplayFailureReason::Unknown(other.to_string()),
        }
    }
}

/// outbox 重放的重试策略
///
/// 延迟 = min(max_delay, base_delay * backoff_factor ^ retries)，默认即 min(30s, 2s * 2^retries)。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// 第 `retry_count` 次失败后的等待时间（毫秒）
    pub fn backoff_delay_ms(&self, retry_count: u32, reason: &ReplayFailureReason) -> u64 {
        let base = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_count as f64);
        let capped = (base * reason.get_delay_multiplier()).min(self.max_delay_ms as f64);
        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        (capped + jitter).max(0.0) as u64
    }

    /// 第 `failures` 次失败后的下次可重放时间（毫秒时间戳）；不应再重试时返回 None
    pub fn calculate_next_retry_time(
        &self,
        failures: u32,
        reason: &ReplayFailureReason,
        now_ms: i64,
    ) -> Option<i64> {
        if !self.should_retry(failures, reason) {
            return None;
        }
        let delay = self.backoff_delay_ms(failures.saturating_sub(1), reason);
        Some(now_ms + delay as i64)
    }

    /// `retry_count` 为已失败次数
    pub fn should_retry(&self, retry_count: u32, reason: &ReplayFailureReason) -> bool {
        retry_count < self.max_retries && reason.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(ReplayFailureReason::Timeout.is_retryable());
        assert!(ReplayFailureReason::Network.is_retryable());
        assert!(ReplayFailureReason::Server(503).is_retryable());
        assert!(ReplayFailureReason::AuthFailure.is_retryable());
        assert!(ReplayFailureReason::RateLimited.is_retryable());
        assert!(!ReplayFailureReason::Rejected(422).is_retryable());
    }

    #[test]
    fn test_classification_from_error() {
        let reason = |e: SyncError| ReplayFailureReason::from(&e);
        assert_eq!(reason(SyncError::Timeout("t".into())), ReplayFailureReason::Timeout);
        assert_eq!(reason(SyncError::Network("n".into())), ReplayFailureReason::Network);
        assert_eq!(
            reason(SyncError::Http { status: 400, message: "bad".into() }),
            ReplayFailureReason::Rejected(400)
        );
        assert_eq!(
            reason(SyncError::Http { status: 502, message: "gw".into() }),
            ReplayFailureReason::Server(502)
        );
        assert_eq!(
            reason(SyncError::Http { status: 429, message: "slow".into() }),
            ReplayFailureReason::RateLimited
        );
        assert_eq!(
            reason(SyncError::Http { status: 408, message: "t".into() }),
            ReplayFailureReason::Timeout
        );
    }

    #[test]
    fn test_backoff_matches_default_schedule() {
        let policy = RetryPolicy::default();
        let net = ReplayFailureReason::Network;
        assert_eq!(policy.backoff_delay_ms(0, &net), 2_000);
        assert_eq!(policy.backoff_delay_ms(1, &net), 4_000);
        assert_eq!(policy.backoff_delay_ms(3, &net), 16_000);
        assert_eq!(policy.backoff_delay_ms(4, &net), 30_000);
        assert_eq!(policy.backoff_delay_ms(10, &net), 30_000);
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        let net = ReplayFailureReason::Network;
        assert!(policy.should_retry(4, &net));
        assert!(!policy.should_retry(5, &net));
        assert!(!policy.should_retry(0, &ReplayFailureReason::Rejected(404)));
        assert_eq!(policy.calculate_next_retry_time(1, &net, 1_000), Some(3_000));
        assert_eq!(policy.calculate_next_retry_time(2, &net, 1_000), Some(5_000));
        assert_eq!(policy.calculate_next_retry_time(5, &net, 1_000), None);
    }
}
