//! 缓存网关 - 请求拦截与离线降级策略
//!
//! 网关是一个独立的 tokio 任务，所有请求通过 channel 命令传递，
//! 不与应用逻辑共享内存。策略按资源类型区分：
//! - 动态 API 读取：网络优先，失败降级到缓存（带过期标记）或兜底数据
//! - 静态资源读取：缓存优先，文档类资源失败时回退到壳页面
//! - 写操作：直接走网络，5xx/网络失败带退避重试后转入变更队列

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{MedsyncSDKError, Result};
use crate::events::{now_ms, EngineEvent, EventManager};
use crate::resource::ResourceFamily;
use crate::storage::queue::{MutationQueue, QueuedOperation, ReplayFailureReason, RetryPolicy};
use crate::transport::{ApiRequest, HttpTransport};

pub mod cache;

pub use cache::{cache_key, CacheStats, CachedResponse, Freshness, ResponseCache};

/// 文档类静态资源失败时回退的壳页面
pub const SHELL_PATH: &str = "/index.html";

/// 读取结果
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub payload: serde_json::Value,
    pub freshness: Freshness,
    pub family: ResourceFamily,
}

/// 写操作结果
///
/// Queued 是与真正成功可区分的"已受理、已排队"伪成功：
/// 调用方拿到的是队列操作 id，而不是服务端响应。
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    /// 服务端已确认
    Applied {
        status: u16,
        payload: serde_json::Value,
    },
    /// 已转入变更队列，等待重连后回放
    Queued { operation_id: u64 },
}

impl MutationOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued { .. })
    }
}

/// 网关命令
enum GatewayCommand {
    Fetch {
        request: ApiRequest,
        respond_to: oneshot::Sender<Result<FetchOutcome>>,
    },
    Mutate {
        operation: QueuedOperation,
        respond_to: oneshot::Sender<Result<MutationOutcome>>,
    },
    Invalidate {
        family: ResourceFamily,
        respond_to: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

/// 网关句柄 - 应用侧唯一的访问入口
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    sender: mpsc::Sender<GatewayCommand>,
}

impl GatewayHandle {
    /// 读取资源（GET）
    pub async fn fetch(&self, request: ApiRequest) -> Result<FetchOutcome> {
        if !request.is_get() {
            return Err(MedsyncSDKError::InvalidOperation(
                "fetch 只接受 GET 请求，写操作请用 mutate".to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(GatewayCommand::Fetch {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| MedsyncSDKError::ShuttingDown("网关已停止".to_string()))?;
        rx.await
            .map_err(|_| MedsyncSDKError::ShuttingDown("网关未应答".to_string()))?
    }

    /// 执行写操作
    pub async fn mutate(&self, operation: QueuedOperation) -> Result<MutationOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(GatewayCommand::Mutate {
                operation,
                respond_to: tx,
            })
            .await
            .map_err(|_| MedsyncSDKError::ShuttingDown("网关已停止".to_string()))?;
        rx.await
            .map_err(|_| MedsyncSDKError::ShuttingDown("网关未应答".to_string()))?
    }

    /// 显式失效资源族缓存
    pub async fn invalidate(&self, family: ResourceFamily) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(GatewayCommand::Invalidate {
                family,
                respond_to: tx,
            })
            .await
            .map_err(|_| MedsyncSDKError::ShuttingDown("网关已停止".to_string()))?;
        rx.await
            .map_err(|_| MedsyncSDKError::ShuttingDown("网关未应答".to_string()))?
    }

    /// 停止网关任务
    pub async fn shutdown(&self) {
        let _ = self.sender.send(GatewayCommand::Shutdown).await;
    }
}

/// 网关内部状态（各命令处理任务共享）
struct GatewayInner {
    cache: Arc<ResponseCache>,
    transport: Arc<dyn HttpTransport>,
    queue: Arc<MutationQueue>,
    events: Arc<EventManager>,
    retry: RetryPolicy,
}

/// 缓存网关 Actor
pub struct CacheGateway {
    inner: Arc<GatewayInner>,
    receiver: mpsc::Receiver<GatewayCommand>,
}

impl CacheGateway {
    /// 启动网关任务并返回句柄
    pub fn spawn(
        cache: Arc<ResponseCache>,
        transport: Arc<dyn HttpTransport>,
        queue: Arc<MutationQueue>,
        events: Arc<EventManager>,
        retry: RetryPolicy,
        generation: u32,
    ) -> GatewayHandle {
        let (sender, receiver) = mpsc::channel(64);

        let actor = CacheGateway {
            inner: Arc::new(GatewayInner {
                cache,
                transport,
                queue,
                events,
                retry,
            }),
            receiver,
        };
        tokio::spawn(actor.run(generation));

        GatewayHandle { sender }
    }

    /// Actor 主循环（命令在代号激活完成后才开始处理）
    ///
    /// 每条命令派发到独立任务：并发读取互不阻塞，写操作的退避重试
    /// 也不会拖住后续请求。并发读取之间不做全局排序，缓存按
    /// 后写者胜出（last-writer-wins）。
    async fn run(mut self, generation: u32) {
        if let Err(e) = self.inner.cache.activate_generation(generation).await {
            error!("❌ 网关代号激活失败: {}", e);
        }
        info!("🚀 缓存网关已启动, generation={}", generation);

        while let Some(command) = self.receiver.recv().await {
            let inner = self.inner.clone();
            match command {
                GatewayCommand::Fetch {
                    request,
                    respond_to,
                } => {
                    tokio::spawn(async move {
                        let result = inner.handle_fetch(&request).await;
                        let _ = respond_to.send(result);
                    });
                }
                GatewayCommand::Mutate {
                    operation,
                    respond_to,
                } => {
                    tokio::spawn(async move {
                        let result = inner.handle_mutation(operation).await;
                        let _ = respond_to.send(result);
                    });
                }
                GatewayCommand::Invalidate { family, respond_to } => {
                    tokio::spawn(async move {
                        let result = inner.cache.invalidate_family(family).await;
                        let _ = respond_to.send(result);
                    });
                }
                GatewayCommand::Shutdown => break,
            }
        }

        info!("✅ 缓存网关已停止");
    }
}

impl GatewayInner {
    async fn handle_fetch(&self, request: &ApiRequest) -> Result<FetchOutcome> {
        let family = ResourceFamily::from_path(&request.path);
        if family.is_static() {
            self.fetch_static(request).await
        } else {
            self.fetch_dynamic(request, family).await
        }
    }

    /// 动态 API 资源：网络优先
    async fn fetch_dynamic(
        &self,
        request: &ApiRequest,
        family: ResourceFamily,
    ) -> Result<FetchOutcome> {
        let failure = match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => {
                self.cache
                    .put(family, &request.method, &request.path, resp.body.clone())
                    .await?;
                return Ok(FetchOutcome {
                    payload: resp.body,
                    freshness: Freshness::Fresh,
                    family,
                });
            }
            // 4xx 是调用方的问题，不用缓存掩盖
            Ok(resp) if resp.is_client_error() => {
                return Err(MedsyncSDKError::from_status(
                    resp.status,
                    format!("GET {} 被拒绝", request.path),
                ));
            }
            Ok(resp) => format!("server returned {}", resp.status),
            Err(e) => e.to_string(),
        };

        // 5xx 或网络失败：降级到缓存；过了网络确认的数据一律带过期标记
        if let Some((entry, _)) = self.cache.get(family, &request.method, &request.path).await? {
            debug!("网络不可用，提供缓存副本: {} ({})", request.path, failure);
            return Ok(FetchOutcome {
                payload: entry.data,
                freshness: Freshness::Stale,
                family,
            });
        }

        warn!("网络不可用且无缓存，返回兜底数据: {} ({})", request.path, failure);
        Ok(FetchOutcome {
            payload: family.fallback_payload(),
            freshness: Freshness::Fallback,
            family,
        })
    }

    /// 静态资源：缓存优先
    async fn fetch_static(&self, request: &ApiRequest) -> Result<FetchOutcome> {
        let family = ResourceFamily::StaticAssets;

        if let Some((entry, stale)) = self.cache.get(family, &request.method, &request.path).await? {
            return Ok(FetchOutcome {
                payload: entry.data,
                freshness: if stale { Freshness::Stale } else { Freshness::Fresh },
                family,
            });
        }

        // 缓存未命中：回源并填充
        let err = match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => {
                self.cache
                    .put(family, &request.method, &request.path, resp.body.clone())
                    .await?;
                return Ok(FetchOutcome {
                    payload: resp.body,
                    freshness: Freshness::Fresh,
                    family,
                });
            }
            Ok(resp) => {
                MedsyncSDKError::from_status(resp.status, format!("GET {} 失败", request.path))
            }
            Err(e) => e,
        };

        // 文档类资源回退到壳页面
        if is_document(&request.path) {
            if let Some((shell, _)) = self.cache.get(family, "GET", SHELL_PATH).await? {
                warn!("文档资源不可达，回退到壳页面: {}", request.path);
                return Ok(FetchOutcome {
                    payload: shell.data,
                    freshness: Freshness::Stale,
                    family,
                });
            }
        }

        Err(err)
    }

    /// 写操作：直接走网络；5xx/网络失败带退避重试，耗尽后入队
    async fn handle_mutation(&self, operation: QueuedOperation) -> Result<MutationOutcome> {
        let request = operation.to_request();
        let family = operation.family;
        let mut attempt = 0u32;

        loop {
            let failure = match self.transport.execute(&request).await {
                Ok(resp) if resp.is_success() => {
                    // 成功后失效受影响资源族及其派生族
                    self.cache.invalidate_with_derived(family).await?;
                    debug!("写操作成功: {} {} -> {}", request.method, request.path, resp.status);
                    return Ok(MutationOutcome::Applied {
                        status: resp.status,
                        payload: resp.body,
                    });
                }
                // 4xx 非瞬态，立即上报，不入队
                Ok(resp) if resp.is_client_error() => {
                    return Err(MedsyncSDKError::from_status(
                        resp.status,
                        format!("{} {} 被拒绝", request.method, request.path),
                    ));
                }
                Ok(resp) => ReplayFailureReason::ServerError(resp.status),
                Err(e) => ReplayFailureReason::from(&e),
            };

            match self.retry.calculate_delay_ms(attempt, &failure) {
                Some(delay_ms) => {
                    debug!(
                        "写操作失败（{:?}），{}ms 后重试 (attempt={})",
                        failure, delay_ms, attempt
                    );
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
                None => {
                    // 重试耗尽：转入变更队列，返回可区分的"已排队"结果
                    let endpoint = operation.endpoint.clone();
                    let operation_id = self.queue.enqueue(operation).await?;
                    let depth = self.queue.len().await.unwrap_or(0);

                    info!("📥 写操作已入队: id={}, endpoint={}", operation_id, endpoint);
                    self.events
                        .emit(EngineEvent::OperationQueued {
                            operation_id,
                            endpoint,
                            timestamp: now_ms(),
                        })
                        .await;
                    self.events
                        .emit(EngineEvent::QueueDepthChanged {
                            depth,
                            timestamp: now_ms(),
                        })
                        .await;

                    return Ok(MutationOutcome::Queued { operation_id });
                }
            }
        }
    }
}

/// 是否为文档类静态资源（页面）
fn is_document(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    if path.ends_with(".html") || path == "/" {
        return true;
    }
    // 最后一段不含扩展名的路径按页面处理
    path.rsplit('/').next().map(|seg| !seg.contains('.')).unwrap_or(false)
}
