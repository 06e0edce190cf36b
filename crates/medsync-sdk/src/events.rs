//! 事件系统模块 - 同步引擎的生命周期事件
//!
//! 功能包括：
//! - 同步过程生命周期事件（开始 / 进度 / 成功 / 失败 / 结束）
//! - 网络状态、队列深度、缓存刷新事件
//! - 乐观更新令牌事件
//! - 事件广播和订阅机制
//!
//! 扇出对订阅方互相隔离：广播通道天然不被慢接收方阻塞，回调监听器
//! 逐个包在 panic 屏障里，一个抛异常的监听器不会中断其余投递。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::network::NetworkStatus;
use crate::resource::ResourceFamily;
use crate::sync::SyncStep;

/// 引擎事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// 同步开始
    SyncStarted { timestamp: u64 },
    /// 同步进度（按步骤上报计数）
    SyncProgress {
        step: SyncStep,
        queued: usize,
        successful: usize,
        failed: usize,
        timestamp: u64,
    },
    /// 同步成功结束
    SyncSucceeded {
        successful: usize,
        failed: usize,
        timestamp: u64,
    },
    /// 同步带错误结束
    SyncFailed { error: String, timestamp: u64 },
    /// 同步结束（无论成败都发）
    SyncCompleted { duration_ms: u64, timestamp: u64 },
    /// 网络状态变更
    ConnectivityChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: u64,
    },
    /// 写操作已入队（离线降级）
    OperationQueued {
        operation_id: u64,
        endpoint: String,
        timestamp: u64,
    },
    /// 排队操作回放成功
    OperationReplayed { operation_id: u64, timestamp: u64 },
    /// 排队操作被终态丢弃（超龄或 4xx）
    OperationDropped {
        operation_id: u64,
        reason: String,
        timestamp: u64,
    },
    /// 队列深度变化（UI 据此显示待同步计数）
    QueueDepthChanged { depth: usize, timestamp: u64 },
    /// 资源族缓存已刷新
    CacheRefreshed {
        family: ResourceFamily,
        entries: usize,
        timestamp: u64,
    },
    /// 乐观更新已应用
    OptimisticApplied {
        token_id: String,
        entity_id: String,
        timestamp: u64,
    },
    /// 乐观更新已确认
    OptimisticConfirmed {
        token_id: String,
        entity_id: String,
        timestamp: u64,
    },
    /// 乐观更新已回退
    OptimisticReverted {
        token_id: String,
        entity_id: String,
        timestamp: u64,
    },
}

impl EngineEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::SyncStarted { .. } => "sync_started",
            EngineEvent::SyncProgress { .. } => "sync_progress",
            EngineEvent::SyncSucceeded { .. } => "sync_succeeded",
            EngineEvent::SyncFailed { .. } => "sync_failed",
            EngineEvent::SyncCompleted { .. } => "sync_completed",
            EngineEvent::ConnectivityChanged { .. } => "connectivity_changed",
            EngineEvent::OperationQueued { .. } => "operation_queued",
            EngineEvent::OperationReplayed { .. } => "operation_replayed",
            EngineEvent::OperationDropped { .. } => "operation_dropped",
            EngineEvent::QueueDepthChanged { .. } => "queue_depth_changed",
            EngineEvent::CacheRefreshed { .. } => "cache_refreshed",
            EngineEvent::OptimisticApplied { .. } => "optimistic_applied",
            EngineEvent::OptimisticConfirmed { .. } => "optimistic_confirmed",
            EngineEvent::OptimisticReverted { .. } => "optimistic_reverted",
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> u64 {
        match self {
            EngineEvent::SyncStarted { timestamp }
            | EngineEvent::SyncProgress { timestamp, .. }
            | EngineEvent::SyncSucceeded { timestamp, .. }
            | EngineEvent::SyncFailed { timestamp, .. }
            | EngineEvent::SyncCompleted { timestamp, .. }
            | EngineEvent::ConnectivityChanged { timestamp, .. }
            | EngineEvent::OperationQueued { timestamp, .. }
            | EngineEvent::OperationReplayed { timestamp, .. }
            | EngineEvent::OperationDropped { timestamp, .. }
            | EngineEvent::QueueDepthChanged { timestamp, .. }
            | EngineEvent::CacheRefreshed { timestamp, .. }
            | EngineEvent::OptimisticApplied { timestamp, .. }
            | EngineEvent::OptimisticConfirmed { timestamp, .. }
            | EngineEvent::OptimisticReverted { timestamp, .. } => *timestamp,
        }
    }
}

/// 当前毫秒时间戳
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&EngineEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<EngineEvent>,
    /// 事件监听器映射（事件类型 -> 监听器列表，"*" 为通配）
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: EngineEvent) {
        debug!("Emitting event: {}", event.event_type());

        // 更新统计
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 广播事件（无订阅者时 send 会失败，属正常场景，仅打 debug）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 调用监听器，逐个包在 panic 屏障里
        let listeners = self.listeners.read().await;
        let deliver = |group: &str| {
            if let Some(group_listeners) = listeners.get(group) {
                for listener in group_listeners {
                    if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                        warn!("⚠️ 事件监听器 panic，已跳过: type={}", event.event_type());
                    }
                }
            }
        };
        deliver(event.event_type());
        deliver("*");
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器（event_type 为 "*" 时接收全部事件）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
