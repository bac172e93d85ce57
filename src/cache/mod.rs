//! 响应缓存模块
//!
//! 三种后端共用 [`CacheStore`] 接口：禁用 / 内存 TTL / SQLite 持久化 TTL。
//! 后端在启动时按配置选定，多个代理实例共享同一个实例。

pub mod key;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::HeaderMultiMap;
use crate::common::serde_helpers::{base64_bytes, duration_nanos};
use crate::model::config::{CacheConfig, CacheMode};

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// 成功响应的不可变快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    #[serde(default, with = "base64_bytes")]
    pub response_body: Bytes,
    #[serde(default)]
    pub response_headers: HeaderMultiMap,
    pub status_code: u16,
    /// 原始请求耗时，用于模拟延迟
    #[serde(default, with = "duration_nanos")]
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite 错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("缓存条目编解码失败: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("缓存已关闭")]
    Closed,
    #[error("缓存锁已损坏")]
    Poisoned,
}

/// 缓存后端接口
///
/// 所有实现都必须支持多个代理实例并发调用。调用方把任何错误当作未命中处理。
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;
    fn close(&self) -> Result<(), CacheError>;
}

/// 禁用缓存：永远未命中
#[derive(Debug, Default)]
pub struct DisabledCache;

impl CacheStore for DisabledCache {
    fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _entry: CacheEntry) -> Result<(), CacheError> {
        Ok(())
    }

    fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// 按配置创建缓存后端
pub fn build_cache_store(config: &CacheConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    let store: Arc<dyn CacheStore> = match config.mode {
        CacheMode::None => Arc::new(DisabledCache),
        CacheMode::Memory => {
            let ttl = config.ttl_duration()?;
            tracing::info!("响应缓存: memory (ttl={})", config.ttl);
            Arc::new(MemoryCache::new(ttl))
        }
        CacheMode::Global => {
            let ttl = config.ttl_duration()?;
            let dir = config.effective_dir();
            let cache = SqliteCache::open(&dir, ttl)?;
            // 清理上次运行遗留的过期条目
            match cache.compact() {
                Ok(stats) if stats.expired_rows > 0 => {
                    tracing::info!("已清理 {} 条过期缓存", stats.expired_rows)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("启动时压缩缓存失败: {}", e),
            }
            tracing::info!(
                "响应缓存: global {} ({} 条, ttl={})",
                dir.display(),
                cache.count().unwrap_or(0),
                config.ttl
            );
            Arc::new(cache)
        }
    };
    Ok(store)
}

/// 在阻塞线程池中查询缓存，失败视为未命中
pub async fn lookup(store: &Arc<dyn CacheStore>, key: &str) -> Option<CacheEntry> {
    let store = store.clone();
    let key = key.to_string();
    match tokio::task::spawn_blocking(move || store.get(&key)).await {
        Ok(Ok(entry)) => entry,
        Ok(Err(e)) => {
            tracing::warn!("读取缓存失败，按未命中处理: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!("缓存查询任务异常: {}", e);
            None
        }
    }
}

/// 后台写入缓存（不等待结果）
///
/// 不在 tokio 运行时内时同步写入
pub fn store_in_background(store: &Arc<dyn CacheStore>, key: String, entry: CacheEntry) {
    let store = store.clone();
    let write = move || {
        if let Err(e) = store.set(&key, entry) {
            tracing::warn!("写入缓存失败: {}", e);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

#[cfg(test)]
pub(crate) fn sample_entry(body: &'static [u8]) -> CacheEntry {
    let mut headers = HeaderMultiMap::new();
    headers.insert(
        "content-type".to_string(),
        vec!["application/json".to_string()],
    );
    CacheEntry {
        response_body: Bytes::from_static(body),
        response_headers: headers,
        status_code: 200,
        duration: Duration::from_millis(120),
        created_at: Utc::now(),
    }
}
