//! 统一 SDK 接口 - MedsyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! MedsyncSDK (组装层)
//!   ├── GatewayHandle (缓存网关，独立任务)
//!   ├── MutationQueue (变更队列)
//!   ├── Synchronizer (同步器)
//!   ├── OptimisticStateController (乐观更新)
//!   ├── ConnectivityMonitor (网络监控)
//!   ├── StorageManager (持久化层)
//!   └── EventManager (事件系统)
//! ```
//!
//! 设计原则：
//! - 无环境单例：所有依赖（存储路径、HTTP 传输、网络监听器）显式注入，
//!   实例按引用传递，带显式 initialize/shutdown 生命周期
//! - 异步优先：主要 API 使用 async/await
//! - 事件驱动：统一的事件广播机制

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{MedsyncSDKError, Result};
use crate::events::{EngineEvent, EventManager};
use crate::gateway::{CacheGateway, FetchOutcome, GatewayHandle, MutationOutcome, ResponseCache};
use crate::lifecycle::{LifecycleHook, LifecycleManager};
use crate::network::{
    ConnectivityMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener,
};
use crate::optimistic::{AuthorityFetcher, OptimisticStateController};
use crate::resource::ResourceFamily;
use crate::storage::queue::{MutationQueue, QueuedOperation, RetryPolicy};
use crate::storage::StorageManager;
use crate::sync::{SyncResult, Synchronizer};
use crate::transport::{ApiRequest, HttpTransport, ReqwestTransport};

/// 默认网络状态监听器（假设网络始终在线）
///
/// 实际应用应该由平台层提供真实的网络状态监听
#[derive(Debug)]
pub struct DefaultNetworkStatusListener {
    status: Arc<RwLock<NetworkStatus>>,
    sender: Arc<RwLock<Option<broadcast::Sender<NetworkStatusEvent>>>>,
}

impl Default for DefaultNetworkStatusListener {
    fn default() -> Self {
        Self {
            status: Arc::new(RwLock::new(NetworkStatus::Online)),
            sender: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl NetworkStatusListener for DefaultNetworkStatusListener {
    async fn current_status(&self) -> NetworkStatus {
        *self.status.read().await
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (sender, receiver) = broadcast::channel(100);
        {
            let mut sender_guard = self.sender.write().await;
            *sender_guard = Some(sender);
        }
        Ok(receiver)
    }

    async fn stop_monitoring(&self) {
        let mut sender_guard = self.sender.write().await;
        *sender_guard = None;
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 重试配置（写操作入队前的退避重试）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_factor: self.backoff_factor,
            jitter_factor: 0.1,
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// Medsync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedsyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 远端服务基础 URL（例如 https://api.medtrack.example）
    pub api_base_url: String,
    /// 定时同步间隔（毫秒）
    pub sync_interval_ms: u64,
    /// 队列操作最大存活时间（毫秒），超龄操作按终态失败丢弃
    pub queue_max_age_ms: u64,
    /// 动态资源族缓存 TTL（毫秒）
    pub dynamic_cache_ttl_ms: u64,
    /// 静态资源缓存 TTL（毫秒）
    pub static_cache_ttl_ms: u64,
    /// 单个资源族的 TTL 覆盖
    pub family_ttl_overrides: HashMap<ResourceFamily, u64>,
    /// 网络恢复脉冲窗口（毫秒）
    pub recovery_pulse_window_ms: u64,
    /// 启动/回前台时触发同步的过期阈值（毫秒）
    pub startup_stale_threshold_ms: u64,
    /// 网关代号，变更时清空上一代缓存
    pub gateway_generation: u32,
    /// 重试配置
    pub retry_config: RetryConfig,
    /// HTTP 客户端配置
    pub http_client_config: HttpClientConfig,
    /// 事件配置
    pub event_config: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for MedsyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            api_base_url: String::new(),
            sync_interval_ms: 300_000,          // 5 分钟
            queue_max_age_ms: 86_400_000,       // 24 小时
            dynamic_cache_ttl_ms: 300_000,      // 5 分钟
            static_cache_ttl_ms: 86_400_000,    // 24 小时
            family_ttl_overrides: HashMap::new(),
            recovery_pulse_window_ms: 3_000,
            startup_stale_threshold_ms: 300_000,
            gateway_generation: 1,
            retry_config: RetryConfig::default(),
            http_client_config: HttpClientConfig::default(),
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl MedsyncConfig {
    pub fn builder() -> MedsyncConfigBuilder {
        MedsyncConfigBuilder {
            config: MedsyncConfig::default(),
        }
    }

    /// 各资源族的生效 TTL 表
    pub fn cache_ttls(&self) -> HashMap<ResourceFamily, u64> {
        let mut ttls = HashMap::new();
        for family in ResourceFamily::DYNAMIC {
            ttls.insert(family, self.dynamic_cache_ttl_ms);
        }
        ttls.insert(ResourceFamily::StaticAssets, self.static_cache_ttl_ms);
        for (family, ttl) in &self.family_ttl_overrides {
            ttls.insert(*family, *ttl);
        }
        ttls
    }
}

/// 配置构建器
#[derive(Debug, Clone)]
pub struct MedsyncConfigBuilder {
    config: MedsyncConfig,
}

impl MedsyncConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn sync_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    pub fn queue_max_age_ms(mut self, ms: u64) -> Self {
        self.config.queue_max_age_ms = ms;
        self
    }

    pub fn dynamic_cache_ttl_ms(mut self, ms: u64) -> Self {
        self.config.dynamic_cache_ttl_ms = ms;
        self
    }

    pub fn static_cache_ttl_ms(mut self, ms: u64) -> Self {
        self.config.static_cache_ttl_ms = ms;
        self
    }

    /// 覆盖单个资源族的缓存 TTL
    pub fn family_ttl_ms(mut self, family: ResourceFamily, ms: u64) -> Self {
        self.config.family_ttl_overrides.insert(family, ms);
        self
    }

    pub fn recovery_pulse_window_ms(mut self, ms: u64) -> Self {
        self.config.recovery_pulse_window_ms = ms;
        self
    }

    pub fn startup_stale_threshold_ms(mut self, ms: u64) -> Self {
        self.config.startup_stale_threshold_ms = ms;
        self
    }

    pub fn gateway_generation(mut self, generation: u32) -> Self {
        self.config.gateway_generation = generation;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry_config = retry;
        self
    }

    pub fn http_client_config(mut self, http: HttpClientConfig) -> Self {
        self.config.http_client_config = http;
        self
    }

    pub fn event_config(mut self, events: EventConfig) -> Self {
        self.config.event_config = events;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> MedsyncConfig {
        self.config
    }
}

/// 引擎状态快照（UI 的离线指示器与待同步计数）
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// 当前是否在线
    pub is_online: bool,
    /// 变更队列中的待回放操作数
    pub pending_operations: usize,
    /// 最近一次成功同步时间
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// 通过网关拉取权威实体（乐观更新回退时使用）
#[derive(Debug)]
struct GatewayAuthorityFetcher {
    gateway: GatewayHandle,
}

#[async_trait]
impl AuthorityFetcher for GatewayAuthorityFetcher {
    async fn fetch_entity(&self, entity_id: &str) -> Result<Option<serde_json::Value>> {
        let path = format!("/api/{}", entity_id);
        match self.gateway.fetch(ApiRequest::get(&path)).await {
            Ok(outcome) => Ok(Some(outcome.payload)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 前后台生命周期 Hook：回前台补同步，退后台落盘
struct StalenessSyncHook {
    synchronizer: Synchronizer,
    storage: Arc<StorageManager>,
    threshold_ms: u64,
}

#[async_trait]
impl LifecycleHook for StalenessSyncHook {
    async fn on_background(&self) -> Result<()> {
        self.storage.flush().await
    }

    async fn on_foreground(&self) -> Result<()> {
        self.synchronizer.sync_if_stale(self.threshold_ms).await?;
        Ok(())
    }
}

/// Medsync SDK 主入口
pub struct MedsyncSDK {
    config: MedsyncConfig,
    storage: Arc<StorageManager>,
    queue: Arc<MutationQueue>,
    #[allow(dead_code)]
    cache: Arc<ResponseCache>,
    gateway: GatewayHandle,
    monitor: Arc<ConnectivityMonitor>,
    synchronizer: Synchronizer,
    events: Arc<EventManager>,
    optimistic: Arc<OptimisticStateController>,
    lifecycle: LifecycleManager,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl MedsyncSDK {
    /// 使用生产依赖初始化（reqwest 传输 + 默认网络监听器）
    pub async fn initialize(config: MedsyncConfig) -> Result<Arc<Self>> {
        if config.api_base_url.is_empty() {
            return Err(MedsyncSDKError::Config("api_base_url 不能为空".to_string()));
        }

        let transport = Arc::new(ReqwestTransport::new(
            &config.api_base_url,
            &config.http_client_config,
        )?);
        let listener = Arc::new(DefaultNetworkStatusListener::default());

        Self::initialize_with(config, transport, listener).await
    }

    /// 使用注入的传输与网络监听器初始化（测试与平台定制入口）
    pub async fn initialize_with(
        config: MedsyncConfig,
        transport: Arc<dyn HttpTransport>,
        listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(MedsyncSDKError::Config("data_dir 不能为空".to_string()));
        }

        info!("🚀 初始化 Medsync SDK: data_dir={}", config.data_dir.display());

        let storage = Arc::new(StorageManager::init(&config.data_dir).await?);
        let events = Arc::new(EventManager::new(config.event_config.buffer_size));
        let queue = Arc::new(MutationQueue::open(storage.clone(), config.queue_max_age_ms).await?);
        let cache = Arc::new(ResponseCache::new(storage.kv(), config.cache_ttls()));

        let gateway = CacheGateway::spawn(
            cache.clone(),
            transport.clone(),
            queue.clone(),
            events.clone(),
            config.retry_config.to_policy(),
            config.gateway_generation,
        );

        let monitor = Arc::new(ConnectivityMonitor::new(
            listener,
            Duration::from_millis(config.recovery_pulse_window_ms),
        ));
        monitor.start().await?;

        let cancel = CancellationToken::new();
        let synchronizer = Synchronizer::new(
            storage.clone(),
            queue.clone(),
            cache.clone(),
            transport,
            events.clone(),
            cancel.clone(),
        );
        synchronizer.start_periodic(Duration::from_millis(config.sync_interval_ms));
        synchronizer.watch_connectivity(monitor.clone());

        let optimistic = Arc::new(OptimisticStateController::new(
            Arc::new(GatewayAuthorityFetcher {
                gateway: gateway.clone(),
            }),
            events.clone(),
        ));

        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(StalenessSyncHook {
            synchronizer: synchronizer.clone(),
            storage: storage.clone(),
            threshold_ms: config.startup_stale_threshold_ms,
        }));

        // 启动时的过期检查：距上次成功同步超过阈值就补一次同步
        {
            let synchronizer = synchronizer.clone();
            let threshold_ms = config.startup_stale_threshold_ms;
            tokio::spawn(async move {
                if let Err(e) = synchronizer.sync_if_stale(threshold_ms).await {
                    warn!("启动同步检查失败: {}", e);
                }
            });
        }

        info!("✅ Medsync SDK 初始化完成");

        Ok(Arc::new(Self {
            config,
            storage,
            queue,
            cache,
            gateway,
            monitor,
            synchronizer,
            events,
            optimistic,
            lifecycle,
            cancel,
            running: AtomicBool::new(true),
        }))
    }

    /// 关闭 SDK：停止后台任务与网关，落盘存储
    ///
    /// 进行中的同步 pass 不会被中断，只是不再有新的触发。
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("SDK 已关闭，忽略重复 shutdown");
            return Ok(());
        }

        info!("🛑 关闭 Medsync SDK");
        self.cancel.cancel();
        self.gateway.shutdown().await;
        self.monitor.stop().await;
        self.storage.flush().await?;
        info!("✅ Medsync SDK 已关闭");

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MedsyncSDKError::ShuttingDown("SDK 已关闭".to_string()))
        }
    }

    pub fn config(&self) -> &MedsyncConfig {
        &self.config
    }

    // ========== 核心操作 ==========

    /// 触发一次同步（进行中时挂靠到现有 pass）
    pub async fn sync(&self) -> Result<SyncResult> {
        self.ensure_running()?;
        self.synchronizer.sync().await
    }

    /// 最近一次同步结果
    pub fn last_sync_result(&self) -> Option<SyncResult> {
        self.synchronizer.last_result()
    }

    /// 通过网关读取资源
    pub async fn fetch(&self, path: impl Into<String>) -> Result<FetchOutcome> {
        self.ensure_running()?;
        self.gateway.fetch(ApiRequest::get(path)).await
    }

    /// 通过网关执行写操作（失败时自动降级入队）
    pub async fn mutate(&self, operation: QueuedOperation) -> Result<MutationOutcome> {
        self.ensure_running()?;
        self.gateway.mutate(operation).await
    }

    /// 引擎状态快照
    pub async fn status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            is_online: self.monitor.is_online(),
            pending_operations: self.queue.len().await?,
            last_sync_at: self.storage.last_sync().await?,
        })
    }

    // ========== 子组件访问 ==========

    /// 订阅引擎事件流
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn optimistic(&self) -> &Arc<OptimisticStateController> {
        &self.optimistic
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    // ========== 偏好设置 ==========

    pub async fn set_preference<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        self.ensure_running()?;
        self.storage.set_preference(key, value).await
    }

    pub async fn get_preference<V: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
    ) -> Result<Option<V>> {
        self.storage.get_preference(key).await
    }

    // ========== 生命周期 ==========

    /// 宿主应用进入前台
    pub async fn notify_foreground(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.notify_foreground().await
    }

    /// 宿主应用进入后台
    pub async fn notify_background(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.notify_background().await
    }
}
