//! 同步引擎
//!
//! 职责：
//! - 执行完整的对账 pass（排空队列 -> 刷新缓存 -> 记录 last-sync）
//! - 单飞：并发 sync() 调用共享同一个进行中 pass 的结果
//! - 触发来源：显式调用、网络恢复脉冲、定时器、启动时的过期检查
//!
//! 一个 pass 在独立任务里跑到结束，调用方消失（页面跳转等）不会中断它；
//! pass 进行中发起的新 sync() 挂靠到现有结果上，不会取消或重启。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MedsyncSDKError, Result};
use crate::events::{now_ms, EngineEvent, EventManager};
use crate::gateway::ResponseCache;
use crate::network::{ConnectivityMonitor, NetworkStatus};
use crate::resource::ResourceFamily;
use crate::storage::queue::{MutationQueue, ReplayFailureReason};
use crate::storage::StorageManager;
use crate::sync::{SyncIssue, SyncPhase, SyncResult, SyncStep};
use crate::transport::{ApiRequest, HttpTransport};

/// 同步器共享状态
struct SyncShared {
    storage: Arc<StorageManager>,
    queue: Arc<MutationQueue>,
    cache: Arc<ResponseCache>,
    transport: Arc<dyn HttpTransport>,
    events: Arc<EventManager>,
    /// 当前阶段
    phase: parking_lot::RwLock<SyncPhase>,
    /// 进行中 pass 的结果广播（Some 即有 pass 在飞行中）
    inflight: Mutex<Option<broadcast::Sender<SyncResult>>>,
    /// 最近一次结果，保留供查询
    last_result: parking_lot::RwLock<Option<SyncResult>>,
    /// 后台任务（定时器、网络监听）的停止信号
    cancel: CancellationToken,
}

/// 同步器
#[derive(Clone)]
pub struct Synchronizer {
    shared: Arc<SyncShared>,
}

impl Synchronizer {
    pub fn new(
        storage: Arc<StorageManager>,
        queue: Arc<MutationQueue>,
        cache: Arc<ResponseCache>,
        transport: Arc<dyn HttpTransport>,
        events: Arc<EventManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                storage,
                queue,
                cache,
                transport,
                events,
                phase: parking_lot::RwLock::new(SyncPhase::Idle),
                inflight: Mutex::new(None),
                last_result: parking_lot::RwLock::new(None),
                cancel,
            }),
        }
    }

    /// 执行一次同步；已有 pass 在进行时，等待并返回该 pass 的结果
    pub async fn sync(&self) -> Result<SyncResult> {
        let mut receiver = {
            let mut inflight = self.shared.inflight.lock().await;
            let attached = inflight.as_ref().map(|sender| sender.subscribe());
            match attached {
                Some(receiver) => {
                    debug!("同步已在进行，挂靠到当前 pass");
                    receiver
                }
                None => {
                    let (sender, receiver) = broadcast::channel(4);
                    *inflight = Some(sender);

                    let me = self.clone();
                    tokio::spawn(async move {
                        let result = me.run_pass().await;
                        *me.shared.last_result.write() = Some(result.clone());

                        let mut inflight = me.shared.inflight.lock().await;
                        if let Some(sender) = inflight.take() {
                            // 所有等待方（包括发起方）都收到同一份结果
                            let _ = sender.send(result);
                        }
                    });

                    receiver
                }
            }
        };

        receiver
            .recv()
            .await
            .map_err(|e| MedsyncSDKError::Sync(format!("同步结果通道关闭: {}", e)))
    }

    /// 当前阶段
    pub fn phase(&self) -> SyncPhase {
        *self.shared.phase.read()
    }

    pub fn is_syncing(&self) -> bool {
        self.phase() == SyncPhase::Syncing
    }

    /// 最近一次同步结果
    pub fn last_result(&self) -> Option<SyncResult> {
        self.shared.last_result.read().clone()
    }

    // ============================================================
    // pass 执行
    // ============================================================

    async fn run_pass(&self) -> SyncResult {
        let started_at = now_ms();
        *self.shared.phase.write() = SyncPhase::Syncing;
        self.shared
            .events
            .emit(EngineEvent::SyncStarted {
                timestamp: started_at,
            })
            .await;
        info!("🔄 开始同步");

        let mut result = SyncResult {
            started_at,
            finished_at: 0,
            queued: 0,
            successful: 0,
            failed: 0,
            refreshed: HashMap::new(),
            errors: Vec::new(),
        };

        // 步骤 1：按入队顺序排空变更队列
        self.drain_queue(&mut result).await;
        self.emit_progress(SyncStep::DrainQueue, &result).await;

        // 步骤 2：刷新超过 TTL 的缓存条目
        self.refresh_stale_families(&mut result).await;
        self.emit_progress(SyncStep::RefreshCache, &result).await;

        // 步骤 3：整个 pass 无错误才写 last-sync 标记（不按步骤写）
        if result.is_success() {
            if let Err(e) = self.shared.storage.record_last_sync(chrono::Utc::now()).await {
                result.errors.push(SyncIssue {
                    step: SyncStep::Finalize,
                    operation_id: None,
                    family: None,
                    terminal: false,
                    detail: format!("写 last-sync 标记失败: {}", e),
                });
            }
        }
        result.finished_at = now_ms();

        if result.is_success() {
            *self.shared.phase.write() = SyncPhase::Success;
            info!(
                "✅ 同步完成: 回放 {}/{}，耗时 {}ms",
                result.successful,
                result.queued,
                result.duration_ms()
            );
            self.shared
                .events
                .emit(EngineEvent::SyncSucceeded {
                    successful: result.successful,
                    failed: result.failed,
                    timestamp: now_ms(),
                })
                .await;
        } else {
            *self.shared.phase.write() = SyncPhase::Error;
            let first = result
                .errors
                .first()
                .map(|issue| issue.detail.clone())
                .unwrap_or_default();
            warn!("⚠️ 同步带错误结束: {} 个错误，首个: {}", result.errors.len(), first);
            self.shared
                .events
                .emit(EngineEvent::SyncFailed {
                    error: first,
                    timestamp: now_ms(),
                })
                .await;
        }

        self.shared
            .events
            .emit(EngineEvent::SyncCompleted {
                duration_ms: result.duration_ms(),
                timestamp: now_ms(),
            })
            .await;

        // 排空后的队列深度（UI 据此清掉待同步角标）
        if let Ok(depth) = self.shared.queue.len().await {
            self.shared
                .events
                .emit(EngineEvent::QueueDepthChanged {
                    depth,
                    timestamp: now_ms(),
                })
                .await;
        }

        result
    }

    async fn emit_progress(&self, step: SyncStep, result: &SyncResult) {
        self.shared
            .events
            .emit(EngineEvent::SyncProgress {
                step,
                queued: result.queued,
                successful: result.successful,
                failed: result.failed,
                timestamp: now_ms(),
            })
            .await;
    }

    /// 步骤 1：排空变更队列
    ///
    /// 单条操作失败不会中止 pass：可重试失败留在队列里等下个 pass，
    /// 终态失败（超龄、4xx）移出队列并记入错误列表。
    async fn drain_queue(&self, result: &mut SyncResult) {
        let operations = match self.shared.queue.all().await {
            Ok(ops) => ops,
            Err(e) => {
                result.errors.push(SyncIssue {
                    step: SyncStep::DrainQueue,
                    operation_id: None,
                    family: None,
                    terminal: false,
                    detail: format!("读取变更队列失败: {}", e),
                });
                return;
            }
        };

        result.queued = operations.len();
        let max_age_ms = self.shared.queue.max_age_ms();

        for mut op in operations {
            // 超龄操作按终态失败丢弃，不再回放
            if op.is_older_than(max_age_ms) {
                if let Err(e) = self.shared.queue.remove(op.id).await {
                    warn!("移除超龄操作失败: id={}, {}", op.id, e);
                }
                result.failed += 1;
                result.errors.push(SyncIssue {
                    step: SyncStep::DrainQueue,
                    operation_id: Some(op.id),
                    family: Some(op.family),
                    terminal: true,
                    detail: format!("操作超过最大存活时间 {}ms，已丢弃", max_age_ms),
                });
                self.shared
                    .events
                    .emit(EngineEvent::OperationDropped {
                        operation_id: op.id,
                        reason: "expired".to_string(),
                        timestamp: now_ms(),
                    })
                    .await;
                continue;
            }

            // 回放请求与原始写请求逐字节一致，不追加幂等键；
            // 服务端已生效但应答丢失的写会被重复应用，这是已记录的风险
            let request = op.to_request();
            match self.shared.transport.execute(&request).await {
                Ok(resp) if resp.is_success() => {
                    if let Err(e) = self.shared.queue.remove(op.id).await {
                        warn!("移除已回放操作失败: id={}, {}", op.id, e);
                    }
                    // 回放改变了服务端状态，失效对应资源族及派生族，
                    // 随后的刷新步骤会补齐最新数据
                    if let Err(e) = self.shared.cache.invalidate_with_derived(op.family).await {
                        warn!("回放后失效缓存失败: family={}, {}", op.family, e);
                    }
                    result.successful += 1;
                    debug!("回放成功: id={}, {} {}", op.id, request.method, request.path);
                    self.shared
                        .events
                        .emit(EngineEvent::OperationReplayed {
                            operation_id: op.id,
                            timestamp: now_ms(),
                        })
                        .await;
                }
                Ok(resp) if resp.is_client_error() => {
                    // 4xx 非瞬态：移出队列，不在后续 pass 重试
                    if let Err(e) = self.shared.queue.remove(op.id).await {
                        warn!("移除被拒操作失败: id={}, {}", op.id, e);
                    }
                    result.failed += 1;
                    result.errors.push(SyncIssue {
                        step: SyncStep::DrainQueue,
                        operation_id: Some(op.id),
                        family: Some(op.family),
                        terminal: true,
                        detail: format!(
                            "client error {}: {} {} 被服务端拒绝",
                            resp.status, request.method, request.path
                        ),
                    });
                    self.shared
                        .events
                        .emit(EngineEvent::OperationDropped {
                            operation_id: op.id,
                            reason: format!("client error {}", resp.status),
                            timestamp: now_ms(),
                        })
                        .await;
                }
                Ok(resp) => {
                    // 5xx 可重试：留在队列里，下个 pass 再试
                    op.record_failure(format!("server returned {}", resp.status));
                    if let Err(e) = self.shared.queue.update(&op).await {
                        warn!("更新操作重试元数据失败: id={}, {}", op.id, e);
                    }
                    result.failed += 1;
                    result.errors.push(SyncIssue {
                        step: SyncStep::DrainQueue,
                        operation_id: Some(op.id),
                        family: Some(op.family),
                        terminal: false,
                        detail: format!("server error {}: 留队等待重试", resp.status),
                    });
                }
                Err(e) => {
                    let reason = ReplayFailureReason::from(&e);
                    if reason.is_terminal() {
                        if let Err(remove_err) = self.shared.queue.remove(op.id).await {
                            warn!("移除终态失败操作失败: id={}, {}", op.id, remove_err);
                        }
                    } else {
                        op.record_failure(e.to_string());
                        if let Err(update_err) = self.shared.queue.update(&op).await {
                            warn!("更新操作重试元数据失败: id={}, {}", op.id, update_err);
                        }
                    }
                    result.failed += 1;
                    result.errors.push(SyncIssue {
                        step: SyncStep::DrainQueue,
                        operation_id: Some(op.id),
                        family: Some(op.family),
                        terminal: reason.is_terminal(),
                        detail: format!("回放失败: {}", e),
                    });
                }
            }
        }
    }

    /// 步骤 2：刷新各动态资源族中超过 TTL 的条目
    ///
    /// 同族条目并发重抓（条目级 last-writer-wins），单条失败记入
    /// 错误列表，不影响其他资源族。
    async fn refresh_stale_families(&self, result: &mut SyncResult) {
        for family in ResourceFamily::DYNAMIC {
            let stale = match self.shared.cache.stale_entries(family).await {
                Ok(entries) => entries,
                Err(e) => {
                    result.errors.push(SyncIssue {
                        step: SyncStep::RefreshCache,
                        operation_id: None,
                        family: Some(family),
                        terminal: false,
                        detail: format!("读取缓存条目失败: {}", e),
                    });
                    continue;
                }
            };

            if stale.is_empty() {
                result.refreshed.insert(family, false);
                continue;
            }

            let refetches = stale.into_iter().map(|entry| {
                let transport = self.shared.transport.clone();
                async move {
                    let request = ApiRequest::new(entry.method.clone(), entry.path.clone());
                    let outcome = transport.execute(&request).await;
                    (entry, outcome)
                }
            });

            let mut refreshed_count = 0usize;
            for (entry, outcome) in join_all(refetches).await {
                match outcome {
                    Ok(resp) if resp.is_success() => {
                        match self
                            .shared
                            .cache
                            .put(family, &entry.method, &entry.path, resp.body)
                            .await
                        {
                            Ok(()) => refreshed_count += 1,
                            Err(e) => result.errors.push(SyncIssue {
                                step: SyncStep::RefreshCache,
                                operation_id: None,
                                family: Some(family),
                                terminal: false,
                                detail: format!("写入刷新结果失败 {}: {}", entry.path, e),
                            }),
                        }
                    }
                    Ok(resp) => result.errors.push(SyncIssue {
                        step: SyncStep::RefreshCache,
                        operation_id: None,
                        family: Some(family),
                        terminal: false,
                        detail: format!("刷新 {} 失败: status {}", entry.path, resp.status),
                    }),
                    Err(e) => result.errors.push(SyncIssue {
                        step: SyncStep::RefreshCache,
                        operation_id: None,
                        family: Some(family),
                        terminal: false,
                        detail: format!("刷新 {} 失败: {}", entry.path, e),
                    }),
                }
            }

            result.refreshed.insert(family, refreshed_count > 0);
            if refreshed_count > 0 {
                self.shared
                    .events
                    .emit(EngineEvent::CacheRefreshed {
                        family,
                        entries: refreshed_count,
                        timestamp: now_ms(),
                    })
                    .await;
            }
        }
    }

    // ============================================================
    // 触发来源
    // ============================================================

    /// 启动定时同步任务
    pub fn start_periodic(&self, interval: Duration) {
        let me = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = me.shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = me.sync().await {
                            warn!("定时同步失败: {}", e);
                        }
                    }
                }
            }
            debug!("定时同步任务已退出");
        });
    }

    /// 监听网络恢复脉冲：离线 -> 在线 跳变触发一次同步
    pub fn watch_connectivity(&self, monitor: Arc<ConnectivityMonitor>) {
        let me = self.clone();
        let mut receiver = monitor.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = me.shared.cancel.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => {
                            me.shared
                                .events
                                .emit(EngineEvent::ConnectivityChanged {
                                    old_status: event.old_status,
                                    new_status: event.new_status,
                                    timestamp: event.timestamp,
                                })
                                .await;

                            let recovered = event.old_status == NetworkStatus::Offline
                                && event.new_status == NetworkStatus::Online;
                            if recovered && monitor.consume_recovery_pulse() {
                                info!("📡 网络恢复，触发同步");
                                if let Err(e) = me.sync().await {
                                    warn!("恢复触发的同步失败: {}", e);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("网络事件积压，跳过 {} 条", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("网络监听任务已退出");
        });
    }

    /// 启动/回前台时的过期检查：距上次成功同步超过阈值才触发
    pub async fn sync_if_stale(&self, threshold_ms: u64) -> Result<Option<SyncResult>> {
        let last = self.shared.storage.last_sync().await?;
        let is_stale = match last {
            Some(ts) => now_ms().saturating_sub(ts.timestamp_millis() as u64) > threshold_ms,
            None => true,
        };

        if is_stale {
            debug!("上次同步已过期（last={:?}），触发同步", last);
            Ok(Some(self.sync().await?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::{OperationKind, QueuedOperation};
    use crate::transport::test_helpers::{MockOutcome, MockTransport};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        sync: Synchronizer,
        transport: Arc<MockTransport>,
        queue: Arc<MutationQueue>,
        cache: Arc<ResponseCache>,
        storage: Arc<StorageManager>,
        events: Arc<EventManager>,
        _dir: TempDir,
    }

    async fn harness(ttls: HashMap<ResourceFamily, u64>) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::init(dir.path()).await.unwrap());
        let queue = Arc::new(MutationQueue::open(storage.clone(), 86_400_000).await.unwrap());
        let cache = Arc::new(ResponseCache::new(storage.kv(), ttls));
        let transport = Arc::new(MockTransport::new());
        let events = Arc::new(EventManager::new(256));

        let sync = Synchronizer::new(
            storage.clone(),
            queue.clone(),
            cache.clone(),
            transport.clone(),
            events.clone(),
            CancellationToken::new(),
        );

        Harness {
            sync,
            transport,
            queue,
            cache,
            storage,
            events,
            _dir: dir,
        }
    }

    fn post_op(name: &str) -> QueuedOperation {
        QueuedOperation::new(
            "/api/medications",
            OperationKind::Create {
                payload: json!({ "name": name }),
            },
        )
    }

    #[tokio::test]
    async fn scenario_a_offline_post_replays_exact_body_once() {
        let h = harness(HashMap::new()).await;

        // 离线期间入队 POST /medications {name:"X"}
        h.queue.enqueue(post_op("X")).await.unwrap();

        // 恢复在线后同步
        let result = h.sync.sync().await.unwrap();

        // 恰好一个请求，方法、路径、请求体与原始写请求一致
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/api/medications");
        assert_eq!(requests[0].body, Some(json!({"name": "X"})));

        assert_eq!(result.queued, 1);
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_issues_requests_in_enqueue_order() {
        let h = harness(HashMap::new()).await;

        for name in ["a", "b", "c", "d", "e"] {
            h.queue.enqueue(post_op(name)).await.unwrap();
        }

        let result = h.sync.sync().await.unwrap();
        assert_eq!(result.successful, 5);

        let names: Vec<String> = h
            .transport
            .requests()
            .iter()
            .map(|r| r.body.as_ref().unwrap()["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_back_to_back_sync_is_idempotent() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("X")).await.unwrap();

        let first = h.sync.sync().await.unwrap();
        assert_eq!(first.successful, 1);

        // 队列已空、缓存无过期条目，第二次同步所有计数为零
        let second = h.sync.sync().await.unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.successful, 0);
        assert_eq!(second.failed, 0);
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn scenario_b_stale_entry_refetched_once_with_new_timestamp() {
        let mut ttls = HashMap::new();
        ttls.insert(ResourceFamily::Medications, 0u64); // 写入即过期
        let h = harness(ttls).await;

        h.cache
            .put(ResourceFamily::Medications, "GET", "/api/medications", json!([]))
            .await
            .unwrap();
        let (before, _) = h
            .cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.transport
            .set_default(MockOutcome::Respond(200, json!([{"id": 1}])));

        let result = h.sync.sync().await.unwrap();

        // 恰好一次重抓，时间戳更新为本次刷新时刻
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(h.transport.requests()[0].path, "/api/medications");
        assert_eq!(result.refreshed.get(&ResourceFamily::Medications), Some(&true));

        let (after, _) = h
            .cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .unwrap();
        assert!(after.stored_at > before.stored_at);
        assert_eq!(after.data, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn scenario_c_concurrent_syncs_share_single_pass() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("X")).await.unwrap();

        let (r1, r2) = tokio::join!(h.sync.sync(), h.sync.sync());
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();

        // 底层排空只执行一次，两个调用方拿到等价的结果对象
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(r1.started_at, r2.started_at);
        assert_eq!(r1.successful, 1);
        assert_eq!(r2.successful, 1);
    }

    #[tokio::test]
    async fn scenario_d_replay_4xx_removed_and_not_retried() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("bad")).await.unwrap();
        h.transport
            .push(MockOutcome::Respond(400, json!({"error": "invalid"})));

        let result = h.sync.sync().await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.successful, 0);
        assert!(result.errors[0].terminal);
        assert!(result.errors[0].detail.contains("client error 400"));
        assert_eq!(h.queue.len().await.unwrap(), 0);

        // 下个 pass 不再尝试该操作
        let second = h.sync.sync().await.unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_operation_dropped_as_terminal_failure() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("old")).await.unwrap();

        // 把入队时间改到最大存活时间之前
        let mut op = h.queue.oldest().await.unwrap().unwrap();
        op.enqueued_at = now_ms() - h.queue.max_age_ms() - 60_000;
        h.queue.update(&op).await.unwrap();

        let result = h.sync.sync().await.unwrap();

        // 不发请求、不计成功/排队成功，按终态失败记录
        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(result.queued, 1);
        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 1);
        assert!(result.errors[0].terminal);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_5xx_replay_left_queued_for_next_pass() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("X")).await.unwrap();
        h.transport.push(MockOutcome::Respond(503, json!(null)));

        let first = h.sync.sync().await.unwrap();
        assert_eq!(first.failed, 1);
        assert!(!first.errors[0].terminal);
        assert_eq!(h.queue.len().await.unwrap(), 1);

        // 重试元数据已落盘
        let op = h.queue.oldest().await.unwrap().unwrap();
        assert_eq!(op.attempts, 1);

        // 服务恢复后的下一个 pass 回放成功
        let second = h.sync.sync().await.unwrap();
        assert_eq!(second.successful, 1);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_pass() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("first")).await.unwrap();
        h.queue.enqueue(post_op("second")).await.unwrap();
        h.queue.enqueue(post_op("third")).await.unwrap();

        // 第二条失败，第一、三条照常回放
        h.transport.push(MockOutcome::Respond(200, json!({})));
        h.transport.push(MockOutcome::Respond(500, json!(null)));
        h.transport.push(MockOutcome::Respond(200, json!({})));

        let result = h.sync.sync().await.unwrap();
        assert_eq!(result.successful, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(h.transport.request_count(), 3);
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_sync_marker_written_only_on_clean_pass() {
        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("X")).await.unwrap();
        h.transport.push(MockOutcome::Respond(503, json!(null)));

        h.sync.sync().await.unwrap();
        assert!(h.storage.last_sync().await.unwrap().is_none());

        // 错误清零后的 pass 才写标记
        h.sync.sync().await.unwrap();
        assert!(h.storage.last_sync().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_successful_replay_invalidates_derived_cache() {
        let h = harness(HashMap::new()).await;
        h.cache
            .put(ResourceFamily::Medications, "GET", "/api/medications", json!([]))
            .await
            .unwrap();
        h.cache
            .put(ResourceFamily::Schedule, "GET", "/api/schedule", json!({}))
            .await
            .unwrap();

        h.queue.enqueue(post_op("X")).await.unwrap();
        h.sync.sync().await.unwrap();

        assert!(h
            .cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .is_none());
        assert!(h
            .cache
            .get(ResourceFamily::Schedule, "GET", "/api/schedule")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_events_emitted_in_order() {
        let h = harness(HashMap::new()).await;
        let mut receiver = h.events.subscribe();

        h.queue.enqueue(post_op("X")).await.unwrap();
        h.sync.sync().await.unwrap();

        let mut seen = Vec::new();
        loop {
            let event = receiver.recv().await.unwrap();
            let event_type = event.event_type().to_string();
            let done = event_type == "queue_depth_changed";
            seen.push(event_type);
            if done {
                break;
            }
        }

        assert_eq!(seen[0], "sync_started");
        assert!(seen.contains(&"operation_replayed".to_string()));
        assert!(seen.contains(&"sync_progress".to_string()));
        assert!(seen.contains(&"sync_succeeded".to_string()));
        assert!(seen.contains(&"sync_completed".to_string()));
    }

    #[tokio::test]
    async fn test_sync_if_stale_respects_threshold() {
        let h = harness(HashMap::new()).await;

        // 从未同步过 -> 触发
        let first = h.sync.sync_if_stale(300_000).await.unwrap();
        assert!(first.is_some());

        // 刚同步完 -> 不触发
        let second = h.sync.sync_if_stale(300_000).await.unwrap();
        assert!(second.is_none());

        // 阈值为 0 -> 再次触发
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = h.sync.sync_if_stale(0).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_recovery_pulse_triggers_sync() {
        use crate::network::test_helpers::ManualNetworkListener;

        let h = harness(HashMap::new()).await;
        h.queue.enqueue(post_op("X")).await.unwrap();

        let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Offline));
        let monitor = Arc::new(ConnectivityMonitor::new(
            listener.clone(),
            Duration::from_secs(3),
        ));
        monitor.start().await.unwrap();
        h.sync.watch_connectivity(monitor.clone());

        // 离线 -> 在线 跳变
        listener.report(NetworkStatus::Online);

        // 等待恢复触发的同步完成
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if h.queue.len().await.unwrap() == 0 {
                break;
            }
        }
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_phase_reflects_last_outcome() {
        let h = harness(HashMap::new()).await;
        assert_eq!(h.sync.phase(), SyncPhase::Idle);

        h.sync.sync().await.unwrap();
        assert_eq!(h.sync.phase(), SyncPhase::Success);
        assert!(h.sync.last_result().is_some());

        h.queue.enqueue(post_op("X")).await.unwrap();
        h.transport.push(MockOutcome::Respond(500, json!(null)));
        h.sync.sync().await.unwrap();
        assert_eq!(h.sync.phase(), SyncPhase::Error);
    }
}
