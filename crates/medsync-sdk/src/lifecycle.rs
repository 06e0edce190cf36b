//! SDK 生命周期管理
//!
//! 管理宿主应用前后台切换等一级生命周期事件，统一触发各模块的状态切换。

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// 应用切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// 应用切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// 获取已注册的 Hook 数量
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：应用切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败会记录错误但继续执行其他 Hook
    pub async fn notify_background(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            // 所有 Hook 都已尝试执行，返回第一个错误
            return Err(errors.into_iter().next().unwrap());
        }

        Ok(())
    }

    /// 通知所有 Hook：应用切换到前台
    ///
    /// 按注册顺序执行，某个 Hook 失败会记录错误但继续执行其他 Hook
    pub async fn notify_foreground(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(errors.into_iter().next().unwrap());
        }

        Ok(())
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
