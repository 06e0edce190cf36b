//! 响应缓存
//!
//! 缓存 key 是请求的规范化标识：方法 + 路径（query 参数排序后）取
//! SHA-256。条目带资源族标签与写入时间戳，超过所属资源族 TTL 即视为
//! 过期，但离线时仍可带过期标记继续提供。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;
use crate::resource::ResourceFamily;
use crate::storage::kv::{meta_keys, trees, KvStore};
use crate::storage::cache_tree;

/// 缓存的响应条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// 原请求方法
    pub method: String,
    /// 原请求路径（含 query，刷新时原样重放）
    pub path: String,
    /// 资源族标签
    pub family: ResourceFamily,
    /// 序列化后的载荷
    pub data: serde_json::Value,
    /// 写入时间（毫秒时间戳）
    pub stored_at: u64,
}

impl CachedResponse {
    /// 条目年龄（毫秒）
    pub fn age_ms(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        now.saturating_sub(self.stored_at)
    }
}

/// 缓存新鲜度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    /// 网络返回或 TTL 内的缓存
    Fresh,
    /// 超过 TTL 的缓存，离线降级时带此标记返回
    Stale,
    /// 无缓存可用，返回的是资源族兜底数据
    Fallback,
}

/// 缓存统计信息
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries_by_family: HashMap<ResourceFamily, usize>,
}

/// 请求的规范化标识：query 参数排序后对 "METHOD path?query" 取 SHA-256
pub fn cache_key(method: &str, path: &str) -> String {
    let canonical = match path.split_once('?') {
        Some((base, query)) => {
            let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            params.sort_unstable();
            format!("{} {}?{}", method.to_uppercase(), base, params.join("&"))
        }
        None => format!("{} {}", method.to_uppercase(), path),
    };

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// 响应缓存
#[derive(Debug)]
pub struct ResponseCache {
    kv: Arc<KvStore>,
    /// 各资源族的 TTL（毫秒），未配置的用族默认值
    ttls: HashMap<ResourceFamily, u64>,
}

impl ResponseCache {
    pub fn new(kv: Arc<KvStore>, ttls: HashMap<ResourceFamily, u64>) -> Self {
        Self { kv, ttls }
    }

    /// 资源族的生效 TTL（毫秒）
    pub fn ttl_ms(&self, family: ResourceFamily) -> u64 {
        self.ttls
            .get(&family)
            .copied()
            .unwrap_or_else(|| family.default_ttl_ms())
    }

    /// 写入（或覆盖）一个条目，时间戳取当前时刻
    pub async fn put(
        &self,
        family: ResourceFamily,
        method: &str,
        path: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let entry = CachedResponse {
            method: method.to_uppercase(),
            path: path.to_string(),
            family,
            data,
            stored_at: chrono::Utc::now().timestamp_millis() as u64,
        };

        self.kv
            .set(&cache_tree(family), cache_key(method, path), &entry)
            .await
    }

    /// 读取条目，同时给出是否已过期
    pub async fn get(
        &self,
        family: ResourceFamily,
        method: &str,
        path: &str,
    ) -> Result<Option<(CachedResponse, bool)>> {
        let entry: Option<CachedResponse> = self
            .kv
            .get(&cache_tree(family), cache_key(method, path))
            .await?;

        Ok(entry.map(|e| {
            let stale = e.age_ms() > self.ttl_ms(family);
            (e, stale)
        }))
    }

    /// 资源族的全部条目
    pub async fn entries(&self, family: ResourceFamily) -> Result<Vec<CachedResponse>> {
        let raw: Vec<(Vec<u8>, CachedResponse)> = self.kv.scan(&cache_tree(family)).await?;
        Ok(raw.into_iter().map(|(_, entry)| entry).collect())
    }

    /// 资源族中超过 TTL 的条目（同步器据此刷新）
    pub async fn stale_entries(&self, family: ResourceFamily) -> Result<Vec<CachedResponse>> {
        let ttl = self.ttl_ms(family);
        Ok(self
            .entries(family)
            .await?
            .into_iter()
            .filter(|entry| entry.age_ms() > ttl)
            .collect())
    }

    /// 失效单个资源族的所有条目，返回删除数
    pub async fn invalidate_family(&self, family: ResourceFamily) -> Result<u64> {
        let removed = self.kv.clear_tree(&cache_tree(family)).await?;
        if removed > 0 {
            debug!("缓存失效: family={}, removed={}", family, removed);
        }
        Ok(removed)
    }

    /// 失效资源族及其派生族
    pub async fn invalidate_with_derived(&self, family: ResourceFamily) -> Result<u64> {
        let mut removed = self.invalidate_family(family).await?;
        for derived in family.derived_families() {
            removed += self.invalidate_family(*derived).await?;
        }
        Ok(removed)
    }

    /// 激活网关代号：与持久化的代号不一致时，清空全部上一代缓存条目
    pub async fn activate_generation(&self, generation: u32) -> Result<bool> {
        let stored: Option<u32> = self.kv.get(trees::META, meta_keys::GATEWAY_GENERATION).await?;

        if stored == Some(generation) {
            return Ok(false);
        }

        let mut removed = 0u64;
        for family in [
            ResourceFamily::Medications,
            ResourceFamily::Schedule,
            ResourceFamily::Notifications,
            ResourceFamily::StaticAssets,
        ] {
            removed += self.kv.clear_tree(&cache_tree(family)).await?;
        }

        self.kv
            .set(trees::META, meta_keys::GATEWAY_GENERATION, &generation)
            .await?;

        info!(
            "🔄 网关代号已激活: {:?} -> {}, 清理旧缓存 {} 条",
            stored, generation, removed
        );
        Ok(true)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut entries_by_family = HashMap::new();
        for family in [
            ResourceFamily::Medications,
            ResourceFamily::Schedule,
            ResourceFamily::Notifications,
            ResourceFamily::StaticAssets,
        ] {
            entries_by_family.insert(family, self.kv.len(&cache_tree(family)).await?);
        }
        Ok(CacheStats { entries_by_family })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageManager;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_cache(dir: &TempDir, ttls: HashMap<ResourceFamily, u64>) -> ResponseCache {
        let storage = StorageManager::init(dir.path()).await.unwrap();
        ResponseCache::new(storage.kv(), ttls)
    }

    #[test]
    fn test_cache_key_sorts_query_params() {
        let a = cache_key("GET", "/api/schedule?day=today&limit=10");
        let b = cache_key("get", "/api/schedule?limit=10&day=today");
        assert_eq!(a, b);

        let c = cache_key("GET", "/api/schedule?day=tomorrow&limit=10");
        assert_ne!(a, c);

        // 方法参与标识
        assert_ne!(cache_key("GET", "/api/schedule"), cache_key("POST", "/api/schedule"));
    }

    #[tokio::test]
    async fn test_round_trip_before_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, HashMap::new()).await;

        let payload = json!([{"id": 1, "name": "阿司匹林", "inventory": 30}]);
        cache
            .put(ResourceFamily::Medications, "GET", "/api/medications", payload.clone())
            .await
            .unwrap();

        let (entry, stale) = cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.data, payload);
        assert!(!stale);
    }

    #[tokio::test]
    async fn test_entry_goes_stale_after_ttl() {
        let dir = TempDir::new().unwrap();
        let mut ttls = HashMap::new();
        ttls.insert(ResourceFamily::Medications, 0u64); // TTL 为 0，写入即过期
        let cache = open_cache(&dir, ttls).await;

        cache
            .put(ResourceFamily::Medications, "GET", "/api/medications", json!([]))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let (_, stale) = cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .unwrap();
        assert!(stale);
        assert_eq!(cache.stale_entries(ResourceFamily::Medications).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_with_derived() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, HashMap::new()).await;

        cache
            .put(ResourceFamily::Medications, "GET", "/api/medications", json!([]))
            .await
            .unwrap();
        cache
            .put(ResourceFamily::Schedule, "GET", "/api/schedule", json!({}))
            .await
            .unwrap();
        cache
            .put(ResourceFamily::Notifications, "GET", "/api/notifications", json!([]))
            .await
            .unwrap();

        // 药品变更连带失效用药计划，但不动通知
        let removed = cache
            .invalidate_with_derived(ResourceFamily::Medications)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        assert!(cache
            .get(ResourceFamily::Schedule, "GET", "/api/schedule")
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get(ResourceFamily::Notifications, "GET", "/api/notifications")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_generation_purge() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, HashMap::new()).await;

        // 首次激活
        assert!(cache.activate_generation(1).await.unwrap());
        cache
            .put(ResourceFamily::Medications, "GET", "/api/medications", json!([]))
            .await
            .unwrap();

        // 同代号重复激活不清缓存
        assert!(!cache.activate_generation(1).await.unwrap());
        assert!(cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .is_some());

        // 新代号激活清空上一代条目
        assert!(cache.activate_generation(2).await.unwrap());
        assert!(cache
            .get(ResourceFamily::Medications, "GET", "/api/medications")
            .await
            .unwrap()
            .is_none());
    }
}
