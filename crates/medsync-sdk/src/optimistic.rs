//! 乐观更新控制器
//!
//! 服务端确认之前先改本地视图，并为每次尝试记录一个令牌。
//! 回退（revert）从不做逆变换（像库存扣减这类变换不总是可逆），
//! 而是重新拉取权威数据覆盖本地视图。
//!
//! 已知限制：同一实体同一字段上并发重叠的乐观更新之间不做排序，
//! 约定每个 (实体, 字段) 同时最多一个待确认令牌，由调用方保证。
//! 控制器没有自动超时：调用方不 confirm/revert，令牌会一直处于待确认。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{MedsyncSDKError, Result};
use crate::events::{now_ms, EngineEvent, EventManager};

/// 令牌状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    /// 待确认
    Pending,
    /// 已确认
    Confirmed,
    /// 已回退
    Reverted,
}

/// 乐观更新令牌
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimisticUpdateToken {
    /// 令牌 id（UUID v4）
    pub id: String,
    /// 目标实体 id
    pub entity_id: String,
    /// 已应用状态的快照（删除时为 None）
    pub snapshot: Option<serde_json::Value>,
    /// 应用时间（毫秒时间戳）
    pub applied_at: u64,
    /// 当前状态
    pub status: TokenStatus,
}

/// 权威数据拉取接口 - 回退时重新获取服务端真相
#[async_trait]
pub trait AuthorityFetcher: Send + Sync + std::fmt::Debug {
    /// 拉取实体的权威状态；服务端不存在时返回 None
    async fn fetch_entity(&self, entity_id: &str) -> Result<Option<serde_json::Value>>;
}

/// 令牌统计信息
#[derive(Debug, Clone, Default)]
pub struct TokenStats {
    pub pending: usize,
    pub total_applied: u64,
    pub total_confirmed: u64,
    pub total_reverted: u64,
}

/// 乐观状态控制器
#[derive(Debug)]
pub struct OptimisticStateController {
    /// 本地内存视图（实体 id -> 当前展示状态）
    views: RwLock<HashMap<String, serde_json::Value>>,
    /// 待确认令牌表（令牌 id -> 令牌）
    tokens: RwLock<HashMap<String, OptimisticUpdateToken>>,
    fetcher: Arc<dyn AuthorityFetcher>,
    events: Arc<EventManager>,
    counters: RwLock<TokenStats>,
}

impl OptimisticStateController {
    pub fn new(fetcher: Arc<dyn AuthorityFetcher>, events: Arc<EventManager>) -> Self {
        Self {
            views: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            fetcher,
            events,
            counters: RwLock::new(TokenStats::default()),
        }
    }

    /// 预置实体视图（通常来自一次权威读取）
    pub async fn seed(&self, entity_id: &str, value: serde_json::Value) {
        self.views.write().await.insert(entity_id.to_string(), value);
    }

    /// 读取实体的当前本地视图
    pub async fn view(&self, entity_id: &str) -> Option<serde_json::Value> {
        self.views.read().await.get(entity_id).cloned()
    }

    /// 立即应用一次本地变换并记录待确认令牌
    pub async fn apply<F>(&self, entity_id: &str, transform: F) -> Result<OptimisticUpdateToken>
    where
        F: FnOnce(Option<&serde_json::Value>) -> serde_json::Value,
    {
        let applied = {
            let mut views = self.views.write().await;
            let next = transform(views.get(entity_id));
            views.insert(entity_id.to_string(), next.clone());
            next
        };

        let token = self.record_token(entity_id, Some(applied)).await;
        Ok(token)
    }

    /// 乐观删除：立即从本地视图移除实体
    pub async fn apply_removal(&self, entity_id: &str) -> Result<OptimisticUpdateToken> {
        self.views.write().await.remove(entity_id);
        let token = self.record_token(entity_id, None).await;
        Ok(token)
    }

    async fn record_token(
        &self,
        entity_id: &str,
        snapshot: Option<serde_json::Value>,
    ) -> OptimisticUpdateToken {
        let token = OptimisticUpdateToken {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.to_string(),
            snapshot,
            applied_at: now_ms(),
            status: TokenStatus::Pending,
        };

        self.tokens
            .write()
            .await
            .insert(token.id.clone(), token.clone());

        {
            let mut counters = self.counters.write().await;
            counters.total_applied += 1;
        }

        debug!("乐观更新已应用: token={}, entity={}", token.id, entity_id);
        self.events
            .emit(EngineEvent::OptimisticApplied {
                token_id: token.id.clone(),
                entity_id: entity_id.to_string(),
                timestamp: now_ms(),
            })
            .await;

        token
    }

    /// 确认：相信已应用的本地状态，丢弃令牌
    pub async fn confirm(&self, token_id: &str) -> Result<OptimisticUpdateToken> {
        let mut token = self.take_pending(token_id).await?;
        token.status = TokenStatus::Confirmed;

        {
            let mut counters = self.counters.write().await;
            counters.total_confirmed += 1;
        }

        self.events
            .emit(EngineEvent::OptimisticConfirmed {
                token_id: token.id.clone(),
                entity_id: token.entity_id.clone(),
                timestamp: now_ms(),
            })
            .await;

        Ok(token)
    }

    /// 确认并用服务端的权威响应覆盖本地视图
    pub async fn confirm_with(
        &self,
        token_id: &str,
        authoritative: serde_json::Value,
    ) -> Result<OptimisticUpdateToken> {
        let token = self.confirm(token_id).await?;
        self.views
            .write()
            .await
            .insert(token.entity_id.clone(), authoritative);
        Ok(token)
    }

    /// 回退：丢弃令牌并重新拉取权威状态覆盖本地视图
    ///
    /// 注意：对删除操作回退时，重新拉取会把已在本地移除的实体重新
    /// 写回视图（"复活"）。该行为沿袭原设计，见 DESIGN.md。
    pub async fn revert(&self, token_id: &str) -> Result<OptimisticUpdateToken> {
        let mut token = self.take_pending(token_id).await?;
        token.status = TokenStatus::Reverted;

        match self.fetcher.fetch_entity(&token.entity_id).await? {
            Some(authoritative) => {
                self.views
                    .write()
                    .await
                    .insert(token.entity_id.clone(), authoritative);
            }
            None => {
                self.views.write().await.remove(&token.entity_id);
            }
        }

        {
            let mut counters = self.counters.write().await;
            counters.total_reverted += 1;
        }

        info!("乐观更新已回退: token={}, entity={}", token.id, token.entity_id);
        self.events
            .emit(EngineEvent::OptimisticReverted {
                token_id: token.id.clone(),
                entity_id: token.entity_id.clone(),
                timestamp: now_ms(),
            })
            .await;

        Ok(token)
    }

    async fn take_pending(&self, token_id: &str) -> Result<OptimisticUpdateToken> {
        self.tokens.write().await.remove(token_id).ok_or_else(|| {
            MedsyncSDKError::InvalidOperation(format!("令牌不存在或已结算: {}", token_id))
        })
    }

    /// 查询令牌（仍在待确认表中的）
    pub async fn token(&self, token_id: &str) -> Option<OptimisticUpdateToken> {
        self.tokens.read().await.get(token_id).cloned()
    }

    /// 待确认令牌数
    pub async fn pending_count(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn stats(&self) -> TokenStats {
        let mut stats = self.counters.read().await.clone();
        stats.pending = self.tokens.read().await.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// 测试用权威数据源：固定的服务端状态表
    #[derive(Debug, Default)]
    struct FixtureFetcher {
        entities: Mutex<HashMap<String, serde_json::Value>>,
    }

    impl FixtureFetcher {
        fn with(entries: &[(&str, serde_json::Value)]) -> Arc<Self> {
            let fetcher = Self::default();
            {
                let mut entities = fetcher.entities.lock();
                for (id, value) in entries {
                    entities.insert(id.to_string(), value.clone());
                }
            }
            Arc::new(fetcher)
        }
    }

    #[async_trait]
    impl AuthorityFetcher for FixtureFetcher {
        async fn fetch_entity(&self, entity_id: &str) -> Result<Option<serde_json::Value>> {
            Ok(self.entities.lock().get(entity_id).cloned())
        }
    }

    fn controller(fetcher: Arc<FixtureFetcher>) -> OptimisticStateController {
        OptimisticStateController::new(fetcher, Arc::new(EventManager::new(64)))
    }

    #[tokio::test]
    async fn test_apply_mutates_view_and_records_pending_token() {
        let ctl = controller(FixtureFetcher::with(&[]));
        ctl.seed("medications/1", json!({"name": "布洛芬", "inventory": 10}))
            .await;

        let token = ctl
            .apply("medications/1", |current| {
                let mut next = current.cloned().unwrap();
                next["inventory"] = json!(9);
                next
            })
            .await
            .unwrap();

        assert_eq!(token.status, TokenStatus::Pending);
        assert_eq!(token.snapshot.as_ref().unwrap()["inventory"], 9);
        assert_eq!(ctl.view("medications/1").await.unwrap()["inventory"], 9);
        assert_eq!(ctl.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_confirm_discards_token_and_trusts_applied_state() {
        let ctl = controller(FixtureFetcher::with(&[]));
        ctl.seed("medications/1", json!({"inventory": 10})).await;

        let token = ctl
            .apply("medications/1", |_| json!({"inventory": 9}))
            .await
            .unwrap();
        let confirmed = ctl.confirm(&token.id).await.unwrap();

        assert_eq!(confirmed.status, TokenStatus::Confirmed);
        assert_eq!(ctl.pending_count().await, 0);
        // 已应用的状态原样保留
        assert_eq!(ctl.view("medications/1").await.unwrap()["inventory"], 9);

        // 重复结算同一令牌是错误
        assert!(ctl.confirm(&token.id).await.is_err());
    }

    #[tokio::test]
    async fn test_confirm_with_overwrites_view_with_server_response() {
        let ctl = controller(FixtureFetcher::with(&[]));
        let token = ctl
            .apply("medications/1", |_| json!({"inventory": 9}))
            .await
            .unwrap();

        ctl.confirm_with(&token.id, json!({"inventory": 9, "id": 1, "version": 4}))
            .await
            .unwrap();
        assert_eq!(ctl.view("medications/1").await.unwrap()["version"], 4);
    }

    #[tokio::test]
    async fn test_revert_refetches_authoritative_state() {
        let ctl = controller(FixtureFetcher::with(&[(
            "medications/1",
            json!({"inventory": 10}),
        )]));
        ctl.seed("medications/1", json!({"inventory": 10})).await;

        // 本地乐观扣减库存，随后请求失败 -> 回退
        let token = ctl
            .apply("medications/1", |_| json!({"inventory": 9}))
            .await
            .unwrap();
        let reverted = ctl.revert(&token.id).await.unwrap();

        assert_eq!(reverted.status, TokenStatus::Reverted);
        // 不做逆变换，而是回到服务端权威值
        assert_eq!(ctl.view("medications/1").await.unwrap()["inventory"], 10);
        assert_eq!(ctl.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_revert_after_removal_restores_entity_from_server() {
        // 偏差标记：对删除操作的回退会重新拉取实体，把刚在本地删掉的
        // 条目"复活"在视图里。这是沿袭原设计的已知行为，不是修复对象；
        // 若服务端也删除了该实体（fetch 返回 None），视图则保持移除。
        let ctl = controller(FixtureFetcher::with(&[(
            "medications/7",
            json!({"id": 7, "name": "叶酸"}),
        )]));
        ctl.seed("medications/7", json!({"id": 7, "name": "叶酸"}))
            .await;

        let token = ctl.apply_removal("medications/7").await.unwrap();
        assert!(ctl.view("medications/7").await.is_none());

        ctl.revert(&token.id).await.unwrap();
        // 实体在本地视图中复活
        assert_eq!(ctl.view("medications/7").await.unwrap()["name"], "叶酸");
    }

    #[tokio::test]
    async fn test_revert_removes_view_when_server_has_no_entity() {
        let ctl = controller(FixtureFetcher::with(&[]));
        ctl.seed("medications/9", json!({"id": 9})).await;

        let token = ctl
            .apply("medications/9", |_| json!({"id": 9, "inventory": 1}))
            .await
            .unwrap();
        ctl.revert(&token.id).await.unwrap();

        assert!(ctl.view("medications/9").await.is_none());
    }

    #[tokio::test]
    async fn test_unsettled_token_stays_pending() {
        // 控制器没有自动超时：不 confirm/revert 的令牌一直待确认
        let ctl = controller(FixtureFetcher::with(&[]));
        let token = ctl.apply("medications/1", |_| json!({})).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            ctl.token(&token.id).await.unwrap().status,
            TokenStatus::Pending
        );

        let stats = ctl.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_applied, 1);
        assert_eq!(stats.total_confirmed, 0);
    }
}
