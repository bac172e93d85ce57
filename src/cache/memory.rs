//! 内存 TTL 缓存

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{CacheEntry, CacheError, CacheStore};

/// 过期条目清扫周期
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct MemoryEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

type EntryMap = RwLock<HashMap<String, MemoryEntry>>;

/// 进程内缓存
///
/// 过期条目由后台任务定期清扫，`get` 命中过期条目时也会立即删除
pub struct MemoryCache {
    entries: Arc<EntryMap>,
    ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_sweep_interval(ttl, SWEEP_INTERVAL)
    }

    /// 指定清扫周期（不在 tokio 运行时内时不启动清扫任务，仅靠惰性删除）
    pub fn with_sweep_interval(ttl: Duration, interval: Duration) -> Self {
        let entries: Arc<EntryMap> = Arc::new(RwLock::new(HashMap::new()));

        let sweeper = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let weak = Arc::downgrade(&entries);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(entries) = weak.upgrade() else {
                        break;
                    };
                    let removed = sweep_expired(&entries);
                    if removed > 0 {
                        tracing::debug!("内存缓存清扫: 移除 {} 个过期条目", removed);
                    }
                }
            })
        });

        Self {
            entries,
            ttl,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// 当前条目数（包含尚未清扫的过期条目）
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

fn sweep_expired(entries: &EntryMap) -> usize {
    let now = Instant::now();
    let mut map = entries.write();
    let before = map.len();
    map.retain(|_, e| e.expires_at > now);
    before - map.len()
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = Instant::now();
        {
            let map = self.entries.read();
            match map.get(key) {
                None => return Ok(None),
                Some(e) if e.expires_at > now => return Ok(Some(e.entry.clone())),
                Some(_) => {}
            }
        }

        // 惰性删除：重新检查，避免删掉期间被覆盖写入的新条目
        let mut map = self.entries.write();
        if map.get(key).is_some_and(|e| e.expires_at <= now) {
            map.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .write()
            .insert(key.to_string(), MemoryEntry { entry, expires_at });
        Ok(())
    }

    fn close(&self) -> Result<(), CacheError> {
        self.stop_sweeper();
        self.entries.write().clear();
        Ok(())
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::sample_entry;

    #[test]
    fn test_set_then_get_returns_identical_entry() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let entry = sample_entry(br#"{"id":"chatcmpl-1"}"#);
        cache.set("key", entry.clone()).unwrap();

        let got = cache.get("key").unwrap().expect("应该命中");
        assert_eq!(got, entry);
        assert!(cache.get("other").unwrap().is_none());
    }

    /// 过期后 get 未命中，并惰性删除条目
    #[test]
    fn test_expired_entry_is_evicted_on_get() {
        let cache = MemoryCache::new(Duration::from_millis(20));
        cache.set("key", sample_entry(b"x")).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.len(), 1);
        assert!(cache.get("key").unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = MemoryCache::with_sweep_interval(
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        cache.set("a", sample_entry(b"a")).unwrap();
        cache.set("b", sample_entry(b"b")).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let key = format!("k{}", (i * 100 + j) % 50);
                        cache.set(&key, sample_entry(b"v")).unwrap();
                        let _ = cache.get(&key).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 50);
    }

    #[test]
    fn test_close_clears_entries() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.set("k", sample_entry(b"v")).unwrap();
        cache.close().unwrap();
        assert!(cache.get("k").unwrap().is_none());
    }
}
