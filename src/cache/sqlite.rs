//! SQLite 持久化 TTL 缓存
//!
//! 单表按 key 有序存储（WITHOUT ROWID），每个 key 只保留最新版本。
//! `synchronous = OFF` 换取写入吞吐，后台任务定期删除过期行并增量回收空闲页。

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::task::JoinHandle;

use super::{CacheEntry, CacheError, CacheStore};

/// 压缩周期
const COMPACTION_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// 每轮增量回收的页数
const VACUUM_PAGES_PER_STEP: u32 = 256;
/// 数据库文件名
const DB_FILE: &str = "cache.db";

/// 一次压缩的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub expired_rows: usize,
    pub reclaimed_pages: i64,
}

/// 底层 SQLite 存储（同步）
struct CacheDb {
    conn: Mutex<Option<Connection>>,
}

impl CacheDb {
    fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        // auto_vacuum 需在建表前设置才对新库生效
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                entry BLOB NOT NULL,
                expires_at INTEGER NOT NULL
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }

    fn get(&self, key: &str, now_ms: i64) -> Result<Option<CacheEntry>, CacheError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(CacheError::Closed)?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT entry FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now_ms],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, entry: &CacheEntry, expires_at_ms: i64) -> Result<(), CacheError> {
        let blob = serde_json::to_vec(entry)?;
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(CacheError::Closed)?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, entry, expires_at) VALUES (?1, ?2, ?3)",
            params![key, blob, expires_at_ms],
        )?;
        Ok(())
    }

    fn compact(&self, now_ms: i64) -> Result<CompactionStats, CacheError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(CacheError::Closed)?;

        let expired_rows = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now_ms],
        )?;

        // 循环回收，直到空闲页不再减少
        let mut reclaimed_pages = 0;
        loop {
            let before = freelist_count(conn)?;
            if before == 0 {
                break;
            }
            let mut stmt =
                conn.prepare(&format!("PRAGMA incremental_vacuum({})", VACUUM_PAGES_PER_STEP))?;
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}

            let after = freelist_count(conn)?;
            if after >= before {
                break;
            }
            reclaimed_pages += before - after;
        }

        Ok(CompactionStats {
            expired_rows,
            reclaimed_pages,
        })
    }

    fn count(&self) -> Result<usize, CacheError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(CacheError::Closed)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn close(&self) -> Result<(), CacheError> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| CacheError::Sqlite(e))?;
        }
        Ok(())
    }
}

fn freelist_count(conn: &Connection) -> Result<i64, CacheError> {
    Ok(conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 磁盘持久化缓存，多个代理实例共享
pub struct SqliteCache {
    db: Arc<CacheDb>,
    ttl: Duration,
    compactor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SqliteCache {
    /// 在目录下打开（或创建）缓存数据库，并启动后台压缩任务
    pub fn open(dir: &Path, ttl: Duration) -> Result<Self, CacheError> {
        Self::open_with_interval(dir, ttl, COMPACTION_INTERVAL)
    }

    pub fn open_with_interval(
        dir: &Path,
        ttl: Duration,
        interval: Duration,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)?;
        let db = Arc::new(CacheDb::open(&dir.join(DB_FILE))?);

        let compactor = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let weak = Arc::downgrade(&db);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(db) = weak.upgrade() else {
                        break;
                    };
                    match tokio::task::spawn_blocking(move || db.compact(now_millis())).await {
                        Ok(Ok(stats)) if stats.expired_rows > 0 || stats.reclaimed_pages > 0 => {
                            tracing::debug!(
                                "缓存压缩完成: 删除 {} 条过期记录，回收 {} 页",
                                stats.expired_rows,
                                stats.reclaimed_pages
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(CacheError::Closed)) => break,
                        Ok(Err(e)) => tracing::warn!("缓存压缩失败: {}", e),
                        Err(e) => tracing::warn!("缓存压缩任务异常: {}", e),
                    }
                }
            })
        });

        Ok(Self {
            db,
            ttl,
            compactor: parking_lot::Mutex::new(compactor),
        })
    }

    /// 立即执行一次压缩
    pub fn compact(&self) -> Result<CompactionStats, CacheError> {
        self.db.compact(now_millis())
    }

    /// 当前行数（包含尚未压缩的过期行）
    pub fn count(&self) -> Result<usize, CacheError> {
        self.db.count()
    }
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.db.get(key, now_millis())
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        self.db.set(key, &entry, now_millis().saturating_add(ttl_ms))
    }

    fn close(&self) -> Result<(), CacheError> {
        if let Some(handle) = self.compactor.lock().take() {
            handle.abort();
        }
        self.db.close()
    }
}

impl Drop for SqliteCache {
    fn drop(&mut self) {
        if let Some(handle) = self.compactor.lock().take() {
            handle.abort();
        }
    }
}
