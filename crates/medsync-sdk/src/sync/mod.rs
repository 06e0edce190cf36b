//! 同步器 - 对账过程的类型与引擎
//!
//! 一次对账（pass）按固定顺序执行：排空变更队列 -> 刷新过期缓存 ->
//! 记录 last-sync 标记。每一步各自容错，单项失败只进入结果的错误列表。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resource::ResourceFamily;

pub mod engine;

pub use engine::Synchronizer;

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// 空闲（尚未同步过）
    Idle,
    /// 正在同步
    Syncing,
    /// 上次同步成功
    Success,
    /// 上次同步带错误结束
    Error,
}

/// 同步步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStep {
    /// 排空变更队列
    DrainQueue,
    /// 刷新过期缓存
    RefreshCache,
    /// 收尾（记录 last-sync 标记）
    Finalize,
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStep::DrainQueue => write!(f, "drain_queue"),
            SyncStep::RefreshCache => write!(f, "refresh_cache"),
            SyncStep::Finalize => write!(f, "finalize"),
        }
    }
}

/// 同步过程中收集的单项错误
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncIssue {
    /// 出错的步骤
    pub step: SyncStep,
    /// 相关的队列操作 id（排空阶段）
    pub operation_id: Option<u64>,
    /// 相关的资源族（刷新阶段）
    pub family: Option<ResourceFamily>,
    /// 是否终态失败（不会再重试）
    pub terminal: bool,
    /// 错误描述
    pub detail: String,
}

/// 一次同步的结果，结束后不可变；最近一次结果保留供查询
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// 开始时间（毫秒时间戳）
    pub started_at: u64,
    /// 结束时间（毫秒时间戳）
    pub finished_at: u64,
    /// 本次开始时队列中的操作数
    pub queued: usize,
    /// 回放成功数
    pub successful: usize,
    /// 失败数（含终态丢弃与可重试失败）
    pub failed: usize,
    /// 各资源族是否发生了缓存刷新
    pub refreshed: HashMap<ResourceFamily, bool>,
    /// 收集的错误列表
    pub errors: Vec<SyncIssue>,
}

impl SyncResult {
    /// 整个 pass 是否成功（错误列表为空）
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_at.saturating_sub(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_success_means_empty_errors() {
        let mut result = SyncResult {
            started_at: 100,
            finished_at: 150,
            queued: 0,
            successful: 0,
            failed: 0,
            refreshed: HashMap::new(),
            errors: Vec::new(),
        };
        assert!(result.is_success());
        assert_eq!(result.duration_ms(), 50);

        result.errors.push(SyncIssue {
            step: SyncStep::DrainQueue,
            operation_id: Some(1),
            family: None,
            terminal: false,
            detail: "server returned 503".to_string(),
        });
        assert!(!result.is_success());
    }
}
