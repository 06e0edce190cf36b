//! Medsync SDK - 离线优先的用药记录同步引擎
//!
//! 本 SDK 提供了嵌入用药跟踪应用的完整同步能力，包括：
//! - 🚪 缓存网关：拦截全部出站请求，按资源类型执行缓存/排队策略
//! - 📦 变更队列：离线写操作的持久化 FIFO 记录，重连后按序回放
//! - ⚡ 乐观更新：服务端确认前先改本地视图，失败时回拉权威数据
//! - 🔄 同步器：单飞对账过程，排空队列、刷新过期缓存、记录 last-sync
//! - 📡 网络监控：在线/离线信号与自清除的恢复脉冲
//! - ⚙️ 事件系统：统一的生命周期事件广播和回调机制
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use medsync_sdk::{MedsyncConfig, MedsyncSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = MedsyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.medtrack.example")
//!         .build();
//!
//!     // 初始化 SDK
//!     let sdk = MedsyncSDK::initialize(config).await?;
//!
//!     // 读取药品列表（离线时自动降级到缓存或兜底数据）
//!     let medications = sdk.fetch("/api/medications").await?;
//!     println!("药品: {}", medications.payload);
//!
//!     // 手动触发一次同步
//!     let result = sdk.sync().await?;
//!     println!("回放成功 {}/{}", result.successful, result.queued);
//!
//!     // 关闭 SDK
//!     sdk.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod events;
pub mod gateway;
pub mod lifecycle;
pub mod network;
pub mod optimistic;
pub mod resource;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod transport;

// 重新导出核心类型，方便使用
pub use error::{MedsyncSDKError, Result};
pub use events::{EngineEvent, EventManager, EventStats};
pub use gateway::{
    CacheGateway, CacheStats, CachedResponse, FetchOutcome, Freshness, GatewayHandle,
    MutationOutcome, ResponseCache,
};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{
    ConnectivityMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener,
};
pub use optimistic::{
    AuthorityFetcher, OptimisticStateController, OptimisticUpdateToken, TokenStats, TokenStatus,
};
pub use resource::ResourceFamily;
pub use sdk::{
    DefaultNetworkStatusListener, EngineStatus, EventConfig, HttpClientConfig, MedsyncConfig,
    MedsyncConfigBuilder, MedsyncSDK, RetryConfig,
};
pub use storage::queue::{
    MutationQueue, OperationKind, QueueStats, QueuedOperation, ReplayFailureReason, RetryPolicy,
};
pub use storage::{CacheTier, KvStats, KvStore, StorageManager};
pub use sync::{SyncIssue, SyncPhase, SyncResult, SyncStep, Synchronizer};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};
