//! 网络状态监控
//!
//! 平台层（浏览器宿主、移动端等）通过实现 NetworkStatusListener 提供
//! 在线/离线信号；ConnectivityMonitor 据此维护当前状态，并在
//! 离线->在线 的跳变上产生一个短窗口内自清除的"恢复脉冲"。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 网络状态监听器 trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 监控器共享状态（监听任务与调用方共用）
#[derive(Debug)]
struct MonitorShared {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current: RwLock<NetworkStatus>,
    /// 最近一次 离线->在线 跳变的时刻
    recovered_at: Mutex<Option<Instant>>,
    /// 恢复脉冲的有效窗口
    pulse_window: Duration,
}

impl MonitorShared {
    /// 应用一次状态跳变：更新当前状态、置恢复脉冲、广播事件
    fn apply_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut current = self.current.write();
            let old = *current;
            *current = new_status;
            old
        };

        if old_status == new_status {
            return;
        }

        if old_status == NetworkStatus::Offline && new_status == NetworkStatus::Online {
            *self.recovered_at.lock() = Some(Instant::now());
            debug!("网络恢复，恢复脉冲已置位");
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        };
        let _ = self.status_sender.send(event);
    }
}

/// 网络监控管理器
#[derive(Debug)]
pub struct ConnectivityMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    shared: Arc<MonitorShared>,
}

impl ConnectivityMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>, pulse_window: Duration) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            shared: Arc::new(MonitorShared {
                status_sender,
                current: RwLock::new(NetworkStatus::Offline),
                recovered_at: Mutex::new(None),
                pulse_window,
            }),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        // 以监听器的当前状态为初始值，避免启动即产生一次伪跳变
        let initial = self.listener.current_status().await;
        *self.shared.current.write() = initial;

        let mut receiver = self.listener.start_monitoring().await?;
        let shared = self.shared.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                shared.apply_status(event.new_status);
            }
        });

        Ok(())
    }

    /// 停止监控
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
    }

    /// 当前是否在线
    pub fn is_online(&self) -> bool {
        *self.shared.current.read() == NetworkStatus::Online
    }

    /// 获取当前网络状态
    pub fn current_status(&self) -> NetworkStatus {
        *self.shared.current.read()
    }

    /// 手动设置网络状态（平台层在连接成功/失败后回写）
    pub fn set_status(&self, new_status: NetworkStatus) {
        self.shared.apply_status(new_status);
    }

    /// 查看恢复脉冲是否仍在窗口内（不消费）
    ///
    /// 脉冲在窗口结束后自行清除。这是一个启发式信号：多个独立订阅方
    /// 之间不保证恰好一次投递，预期只有一个后续监听方把它当作恢复触发。
    pub fn was_offline(&self) -> bool {
        let mut recovered_at = self.shared.recovered_at.lock();
        match *recovered_at {
            Some(at) if at.elapsed() <= self.shared.pulse_window => true,
            Some(_) => {
                *recovered_at = None;
                false
            }
            None => false,
        }
    }

    /// 消费恢复脉冲：窗口内第一个调用方取走，之后返回 false
    pub fn consume_recovery_pulse(&self) -> bool {
        let mut recovered_at = self.shared.recovered_at.lock();
        match recovered_at.take() {
            Some(at) if at.elapsed() <= self.shared.pulse_window => true,
            _ => false,
        }
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.shared.status_sender.subscribe()
    }
}
