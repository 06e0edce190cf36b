//! KV 存储模块 - 基于 sled 的本地键值存储
//!
//! 本模块提供：
//! - 按逻辑区域（偏好设置、变更队列、各资源族缓存、引擎元数据）划分的命名 Tree
//! - JSON 序列化的整值读写
//! - 变更队列使用的原始字节接口（key 保持字典序即 FIFO 顺序）

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{MedsyncSDKError, Result};

/// 逻辑区域对应的 Tree 名称
pub mod trees {
    /// 偏好设置（扁平 key -> value）
    pub const PREFERENCES: &str = "preferences";
    /// 变更队列（有序操作记录）
    pub const MUTATION_QUEUE: &str = "mutation_queue";
    /// 引擎元数据（last-sync 标记、网关代号等）
    pub const META: &str = "meta";
    /// 资源族缓存 Tree 的名称前缀
    pub const CACHE_PREFIX: &str = "cache_";
}

/// 元数据区的键
pub mod meta_keys {
    /// 最近一次成功同步时间（ISO-8601 字符串）
    pub const LAST_SYNC: &str = "last_sync_timestamp";
    /// 当前网关代号（激活新代号时清空旧缓存）
    pub const GATEWAY_GENERATION: &str = "gateway_generation";
}

/// KV 存储统计信息
#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub tree_count: usize,
    pub total_keys: u64,
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 已打开的 Tree 实例
    open_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 打开 KV 存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| MedsyncSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（上一实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            MedsyncSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            open_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 获取（按需打开）指定名称的 Tree
    pub async fn tree(&self, name: &str) -> Result<Tree> {
        {
            let open_trees = self.open_trees.read().await;
            if let Some(tree) = open_trees.get(name) {
                return Ok(tree.clone());
            }
        }

        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| MedsyncSDKError::KvStore(format!("打开 Tree 失败: {}", e)))?;

        let mut open_trees = self.open_trees.write().await;
        open_trees.insert(name.to_string(), tree.clone());

        Ok(tree)
    }

    /// 设置键值对（JSON 序列化）
    pub async fn set<K, V>(&self, tree_name: &str, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.tree(tree_name).await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| MedsyncSDKError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| MedsyncSDKError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, tree_name: &str, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.tree(tree_name).await?;

        let result = tree
            .get(key)
            .map_err(|e| MedsyncSDKError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| MedsyncSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对，返回是否存在
    pub async fn delete<K>(&self, tree_name: &str, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.tree(tree_name).await?;

        let result = tree
            .remove(key)
            .map_err(|e| MedsyncSDKError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.is_some())
    }

    /// 按 key 字典序遍历整个 Tree
    pub async fn scan<V>(&self, tree_name: &str) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.tree(tree_name).await?;
        let mut results = Vec::new();

        for result in tree.iter() {
            let (key, value_bytes) =
                result.map_err(|e| MedsyncSDKError::KvStore(format!("遍历键值对失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| MedsyncSDKError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 写入原始字节（队列使用显式 key 保证顺序）
    pub async fn insert_raw<K>(&self, tree_name: &str, key: K, value: Vec<u8>) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.tree(tree_name).await?;
        tree.insert(key, value)
            .map_err(|e| MedsyncSDKError::KvStore(format!("写入原始值失败: {}", e)))?;
        Ok(())
    }

    /// 按 key 字典序读取原始字节
    pub async fn scan_raw(&self, tree_name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree(tree_name).await?;
        let mut results = Vec::new();

        for result in tree.iter() {
            let (key, value_bytes) =
                result.map_err(|e| MedsyncSDKError::KvStore(format!("遍历键值对失败: {}", e)))?;
            results.push((key.to_vec(), value_bytes.to_vec()));
        }

        Ok(results)
    }

    /// Tree 中最大的 key（队列用于恢复单调 id）
    pub async fn last_key(&self, tree_name: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(tree_name).await?;
        let last = tree
            .last()
            .map_err(|e| MedsyncSDKError::KvStore(format!("读取末尾键失败: {}", e)))?;
        Ok(last.map(|(k, _)| k.to_vec()))
    }

    /// 清空指定 Tree，返回删除的条目数
    pub async fn clear_tree(&self, tree_name: &str) -> Result<u64> {
        let tree = self.tree(tree_name).await?;
        let count = tree.len() as u64;
        tree.clear()
            .map_err(|e| MedsyncSDKError::KvStore(format!("清空 Tree 失败: {}", e)))?;
        Ok(count)
    }

    /// Tree 条目数
    pub async fn len(&self, tree_name: &str) -> Result<usize> {
        let tree = self.tree(tree_name).await?;
        Ok(tree.len())
    }

    /// 将缓冲落盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| MedsyncSDKError::KvStore(format!("落盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取统计信息
    pub async fn stats(&self) -> Result<KvStats> {
        let open_trees = self.open_trees.read().await;
        let mut total_keys = 0u64;
        for tree in open_trees.values() {
            total_keys += tree.len() as u64;
        }
        Ok(KvStats {
            tree_count: open_trees.len(),
            total_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path()).await.unwrap();

        let test_data = json!({
            "name": "阿莫西林",
            "inventory": 12
        });

        store
            .set(trees::PREFERENCES, "test_key", &test_data)
            .await
            .unwrap();
        let retrieved: serde_json::Value = store
            .get(trees::PREFERENCES, "test_key")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retrieved, test_data);

        // 删除
        assert!(store.delete(trees::PREFERENCES, "test_key").await.unwrap());
        let deleted: Option<serde_json::Value> =
            store.get(trees::PREFERENCES, "test_key").await.unwrap();
        assert!(deleted.is_none());
        assert!(!store.delete(trees::PREFERENCES, "test_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_raw_scan_preserves_key_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path()).await.unwrap();

        // 大端序 key 保证字典序 == 数值序
        for id in [3u64, 1, 2] {
            store
                .insert_raw(trees::MUTATION_QUEUE, id.to_be_bytes(), vec![id as u8])
                .await
                .unwrap();
        }

        let entries = store.scan_raw(trees::MUTATION_QUEUE).await.unwrap();
        let ids: Vec<u8> = entries.iter().map(|(_, v)| v[0]).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let last = store.last_key(trees::MUTATION_QUEUE).await.unwrap().unwrap();
        assert_eq!(last, 3u64.to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_clear_tree() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path()).await.unwrap();

        for i in 0..3 {
            store
                .set(trees::META, format!("key{}", i), &json!(i))
                .await
                .unwrap();
        }
        assert_eq!(store.len(trees::META).await.unwrap(), 3);

        let removed = store.clear_tree(trees::META).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.len(trees::META).await.unwrap(), 0);
    }
}
