//! 存储管理层
//!
//! 持久化层只有四类逻辑区域：偏好设置、变更队列、各资源族缓存、引擎元数据。
//! 全部落在同一个 sled 数据库的命名 Tree 上，由 StorageManager 统一管理。

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::resource::ResourceFamily;

pub mod kv;
pub mod queue;

pub use kv::{meta_keys, trees, KvStats, KvStore};

/// 资源族对应的缓存 Tree 名称
pub fn cache_tree(family: ResourceFamily) -> String {
    format!("{}{}", trees::CACHE_PREFIX, family.as_str())
}

/// 缓存淘汰层级 - 持久化失败时按此顺序腾空间
///
/// 用药计划缓存可以随时由药品数据重新计算，最先牺牲；
/// 其余动态资源族次之。静态资源壳页面离线时最有价值，不参与淘汰。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// 用药计划缓存
    Schedule,
    /// 其余动态资源族缓存
    General,
}

impl CacheTier {
    /// 淘汰顺序（低优先级在前）
    pub const ORDER: [CacheTier; 2] = [CacheTier::Schedule, CacheTier::General];
}

/// 存储管理器
#[derive(Debug)]
pub struct StorageManager {
    kv: Arc<KvStore>,
}

impl StorageManager {
    /// 初始化存储
    pub async fn init(data_dir: &Path) -> Result<Self> {
        let kv = KvStore::open(data_dir).await?;
        info!("✅ 存储已初始化: {}", data_dir.display());
        Ok(Self { kv: Arc::new(kv) })
    }

    pub fn kv(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    // ========== 偏好设置 ==========

    pub async fn set_preference<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        self.kv.set(trees::PREFERENCES, key, value).await
    }

    pub async fn get_preference<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        self.kv.get(trees::PREFERENCES, key).await
    }

    pub async fn delete_preference(&self, key: &str) -> Result<bool> {
        self.kv.delete(trees::PREFERENCES, key).await
    }

    // ========== last-sync 标记 ==========

    /// 记录最近一次成功同步的时间（ISO-8601 字符串）
    pub async fn record_last_sync(&self, when: DateTime<Utc>) -> Result<()> {
        self.kv
            .set(trees::META, meta_keys::LAST_SYNC, &when.to_rfc3339())
            .await
    }

    /// 读取最近一次成功同步的时间
    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.kv.get(trees::META, meta_keys::LAST_SYNC).await?;
        match raw {
            Some(text) => match DateTime::parse_from_rfc3339(&text) {
                Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
                Err(e) => {
                    // 标记损坏按"从未同步过"处理
                    warn!("last-sync 标记无法解析，忽略: {} ({})", text, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    // ========== 缓存淘汰 ==========

    /// 淘汰指定层级的缓存，返回删除的条目数
    pub async fn evict_cache_tier(&self, tier: CacheTier) -> Result<u64> {
        let families: &[ResourceFamily] = match tier {
            CacheTier::Schedule => &[ResourceFamily::Schedule],
            CacheTier::General => &[ResourceFamily::Medications, ResourceFamily::Notifications],
        };

        let mut removed = 0u64;
        for family in families {
            removed += self.kv.clear_tree(&cache_tree(*family)).await?;
        }
        warn!("⚠️ 持久化空间不足，已淘汰缓存层级 {:?}: {} 条", tier, removed);
        Ok(removed)
    }

    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }

    pub async fn stats(&self) -> Result<KvStats> {
        self.kv.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_last_sync_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageManager::init(temp_dir.path()).await.unwrap();

        assert!(storage.last_sync().await.unwrap().is_none());

        let now = Utc::now();
        storage.record_last_sync(now).await.unwrap();

        let loaded = storage.last_sync().await.unwrap().unwrap();
        // RFC 3339 往返保留毫秒级精度即可
        assert_eq!(loaded.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_preferences() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageManager::init(temp_dir.path()).await.unwrap();

        storage.set_preference("reminder_sound", &"chime").await.unwrap();
        let value: Option<String> = storage.get_preference("reminder_sound").await.unwrap();
        assert_eq!(value.as_deref(), Some("chime"));

        assert!(storage.delete_preference("reminder_sound").await.unwrap());
        let gone: Option<String> = storage.get_preference("reminder_sound").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_eviction_clears_schedule_before_general() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageManager::init(temp_dir.path()).await.unwrap();
        let kv = storage.kv();

        kv.set(&cache_tree(ResourceFamily::Schedule), "a", &1u32)
            .await
            .unwrap();
        kv.set(&cache_tree(ResourceFamily::Medications), "b", &2u32)
            .await
            .unwrap();

        let removed = storage.evict_cache_tier(CacheTier::Schedule).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            kv.len(&cache_tree(ResourceFamily::Medications)).await.unwrap(),
            1
        );

        let removed = storage.evict_cache_tier(CacheTier::General).await.unwrap();
        assert_eq!(removed, 1);
    }
}
