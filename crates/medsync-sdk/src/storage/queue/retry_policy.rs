use serde::{Deserialize, Serialize};

use crate::error::MedsyncSDKError;

/// 回放失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplayFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试
    ServerError(u16),
    /// 客户端错误 - 4xx 不重试（非瞬态）
    ClientError(u16),
    /// 超过最大存活时间 - 终态，不重试
    Expired,
    /// 未知错误
    Unknown(String),
}

impl ReplayFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplayFailureReason::NetworkTimeout => true,
            ReplayFailureReason::NetworkUnavailable => true,
            ReplayFailureReason::ServerError(code) => *code >= 500 && *code < 600,
            ReplayFailureReason::ClientError(_) => false,
            ReplayFailureReason::Expired => false,
            ReplayFailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 判断是否为终态失败（移出队列并计入失败数）
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// 获取重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            ReplayFailureReason::NetworkTimeout => 1.0,
            ReplayFailureReason::NetworkUnavailable => 2.0,
            ReplayFailureReason::ServerError(_) => 1.5,
            _ => 1.0,
        }
    }
}

impl From<&MedsyncSDKError> for ReplayFailureReason {
    fn from(error: &MedsyncSDKError) -> Self {
        match error {
            MedsyncSDKError::Timeout(_) => ReplayFailureReason::NetworkTimeout,
            MedsyncSDKError::Connectivity(_) => ReplayFailureReason::NetworkUnavailable,
            MedsyncSDKError::Transport(_) => ReplayFailureReason::NetworkUnavailable,
            MedsyncSDKError::Client { status, .. } => ReplayFailureReason::ClientError(*status),
            MedsyncSDKError::Server { status, .. } => ReplayFailureReason::ServerError(*status),
            other => ReplayFailureReason::Unknown(other.to_string()),
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 基础延迟时间（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟时间（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 检查是否应该重试
    pub fn should_retry(&self, attempt: u32, reason: &ReplayFailureReason) -> bool {
        attempt < self.max_retries && reason.is_retryable()
    }

    /// 计算下次重试的延迟（毫秒）；不可重试时返回 None
    pub fn calculate_delay_ms(&self, attempt: u32, reason: &ReplayFailureReason) -> Option<u64> {
        if !self.should_retry(attempt, reason) {
            return None;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ attempt)
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(attempt as f64);

        // 应用失败原因的延迟倍数
        let adjusted = base_delay * reason.delay_multiplier();

        // 限制最大延迟
        let capped = adjusted.min(self.max_delay_ms as f64);

        // 添加随机抖动，避免所有操作同时重试
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped + jitter).max(0.0);

        Some(final_delay as u64)
    }
}
