//! 变更队列 - 离线写操作的有序持久化记录
//!
//! 队列建立在 KV 存储之上，key 为单调递增 id 的大端字节序，
//! sled 的字典序遍历即全局 FIFO。排序不按资源族分区，用吞吐量
//! 换取因果顺序推理的简单性。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{MedsyncSDKError, Result};
use crate::storage::kv::trees;
use crate::storage::{CacheTier, StorageManager};

pub mod operation;
pub mod retry_policy;

pub use operation::{OperationKind, QueuedOperation, VersionedOperation, OPERATION_SCHEMA_VERSION};
pub use retry_policy::{ReplayFailureReason, RetryPolicy};

/// 队列统计信息
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// 当前深度
    pub depth: usize,
    /// 最老操作的入队时间（毫秒时间戳）
    pub oldest_enqueued_at: Option<u64>,
}

/// 变更队列
#[derive(Debug)]
pub struct MutationQueue {
    storage: Arc<StorageManager>,
    /// 下一个待分配的操作 id
    next_id: AtomicU64,
    /// 最大存活时间（毫秒），超龄操作在下次排空时按终态失败丢弃
    max_age_ms: u64,
}

impl MutationQueue {
    /// 打开队列，从已落盘的最大 id 恢复单调计数
    pub async fn open(storage: Arc<StorageManager>, max_age_ms: u64) -> Result<Self> {
        let next_id = match storage.kv().last_key(trees::MUTATION_QUEUE).await? {
            Some(key) if key.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key);
                u64::from_be_bytes(buf) + 1
            }
            _ => 1,
        };

        info!("✅ 变更队列已打开, next_id={}", next_id);

        Ok(Self {
            storage,
            next_id: AtomicU64::new(next_id),
            max_age_ms,
        })
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age_ms
    }

    /// 入队：分配 id 与时间戳，持久化后立即返回 id
    ///
    /// 持久化失败时按层级淘汰低优先级缓存后重试，仍失败才上报给调用方。
    pub async fn enqueue(&self, mut op: QueuedOperation) -> Result<u64> {
        op.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        op.enqueued_at = chrono::Utc::now().timestamp_millis() as u64;

        let encoded = VersionedOperation::wrap(op.clone()).encode()?;
        let key = op.id.to_be_bytes();

        let mut last_err = match self
            .storage
            .kv()
            .insert_raw(trees::MUTATION_QUEUE, key, encoded.clone())
            .await
        {
            Ok(()) => {
                debug!("操作已入队: id={}, endpoint={}", op.id, op.endpoint);
                return Ok(op.id);
            }
            Err(e) => e,
        };

        for tier in CacheTier::ORDER {
            warn!("入队持久化失败（{}），尝试淘汰缓存层级 {:?}", last_err, tier);
            self.storage.evict_cache_tier(tier).await?;

            match self
                .storage
                .kv()
                .insert_raw(trees::MUTATION_QUEUE, key, encoded.clone())
                .await
            {
                Ok(()) => {
                    debug!("淘汰后入队成功: id={}", op.id);
                    return Ok(op.id);
                }
                Err(e) => last_err = e,
            }
        }

        Err(MedsyncSDKError::Persistence(format!(
            "入队失败且缓存淘汰无效: {}",
            last_err
        )))
    }

    /// 按入队顺序读取全部操作
    pub async fn all(&self) -> Result<Vec<QueuedOperation>> {
        let entries = self.storage.kv().scan_raw(trees::MUTATION_QUEUE).await?;
        let mut operations = Vec::with_capacity(entries.len());

        for (key, bytes) in entries {
            match VersionedOperation::decode(&bytes) {
                Ok(op) => operations.push(op),
                Err(e) => {
                    // 无法解析的记录跳过，不让一条坏记录卡死整个队列
                    warn!("跳过无法解析的队列记录 key={:?}: {}", key, e);
                }
            }
        }

        Ok(operations)
    }

    /// 队首（最老）的操作
    pub async fn oldest(&self) -> Result<Option<QueuedOperation>> {
        Ok(self.all().await?.into_iter().next())
    }

    /// 更新已入队操作的尝试元数据
    pub async fn update(&self, op: &QueuedOperation) -> Result<()> {
        let encoded = VersionedOperation::wrap(op.clone()).encode()?;
        self.storage
            .kv()
            .insert_raw(trees::MUTATION_QUEUE, op.id.to_be_bytes(), encoded)
            .await
    }

    /// 移除操作（回放成功或终态失败后调用）
    pub async fn remove(&self, id: u64) -> Result<bool> {
        self.storage
            .kv()
            .delete(trees::MUTATION_QUEUE, id.to_be_bytes())
            .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.storage.kv().len(trees::MUTATION_QUEUE).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<u64> {
        self.storage.kv().clear_tree(trees::MUTATION_QUEUE).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let operations = self.all().await?;
        Ok(QueueStats {
            depth: operations.len(),
            oldest_enqueued_at: operations.first().map(|op| op.enqueued_at),
        })
    }
}
