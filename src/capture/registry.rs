//! 请求登记表与观察者通知
//!
//! 登记表由所有代理实例共享，读取方通过 [`RequestRegistry::snapshot`] 拿到一致的完整副本。
//! 新增/更新通知经有界通道发给观察者，通道满时直接丢弃（仅用于界面刷新与日志）。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::record::{RequestRecord, RequestStatus};

/// 被捕获请求与登记表共享的记录
pub type SharedRecord = Arc<RwLock<RequestRecord>>;

/// 观察者通知
#[derive(Debug, Clone)]
pub enum RequestEvent {
    Added(RequestRecord),
    Updated(RequestRecord),
}

pub struct RequestRegistry {
    next_id: AtomicU64,
    records: RwLock<Vec<SharedRecord>>,
    observer: Option<mpsc::Sender<RequestEvent>>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    /// 不带观察者的登记表
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            records: RwLock::new(Vec::new()),
            observer: None,
        }
    }

    /// 带观察者通道的登记表，返回通道接收端
    pub fn with_observer(capacity: usize) -> (Self, mpsc::Receiver<RequestEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let registry = Self {
            observer: Some(sender),
            ..Self::new()
        };
        (registry, receiver)
    }

    /// 登记新请求，分配单调递增的 ID 并发出新增通知
    pub fn register(&self, mut record: RequestRecord) -> SharedRecord {
        let (shared, snapshot) = {
            let mut records = self.records.write();
            record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let snapshot = record.clone();
            let shared = Arc::new(RwLock::new(record));
            records.push(shared.clone());
            (shared, snapshot)
        };
        self.notify(RequestEvent::Added(snapshot));
        shared
    }

    /// 非阻塞通知观察者
    pub fn notify(&self, event: RequestEvent) {
        if let Some(sender) = &self.observer {
            if sender.try_send(event).is_err() {
                tracing::debug!("观察者通道已满或已关闭，丢弃通知");
            }
        }
    }

    /// 全部记录的一致快照（按 ID 升序）
    pub fn snapshot(&self) -> Vec<RequestRecord> {
        let records = self.records.read();
        records.iter().map(|r| r.read().clone()).collect()
    }

    pub fn get(&self, id: u64) -> Option<RequestRecord> {
        let records = self.records.read();
        let index = records
            .binary_search_by_key(&id, |r| r.read().id)
            .ok()?;
        Some(records[index].read().clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 默认观察者：每个请求开始/结束各输出一行日志
pub fn spawn_log_observer(mut receiver: mpsc::Receiver<RequestEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                RequestEvent::Added(record) => {
                    tracing::info!(
                        "[{}] → #{} {} {} {}{}",
                        record.proxy_name,
                        record.id,
                        record.method,
                        record.path,
                        record.model,
                        if record.cached_response { " (cache)" } else { "" }
                    );
                }
                RequestEvent::Updated(record) if record.status != RequestStatus::Pending => {
                    tracing::info!(
                        "[{}] ← #{} {} {} {}B {:?} tokens={}/{} cost=${:.6}{}",
                        record.proxy_name,
                        record.id,
                        record.status_code,
                        record.model,
                        record.response_size,
                        record.duration,
                        record.input_tokens,
                        record.output_tokens,
                        record.cost,
                        if record.cached_response { " (cache)" } else { "" }
                    );
                }
                RequestEvent::Updated(_) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(model: &str) -> RequestRecord {
        RequestRecord {
            model: model.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_assigns_monotonic_ids() {
        let registry = RequestRegistry::new();
        let a = registry.register(pending("a"));
        let b = registry.register(pending("b"));
        assert_eq!(a.read().id, 1);
        assert_eq!(b.read().id, 2);
        assert_eq!(registry.len(), 2);
    }

    /// 快照是副本，之后的修改不影响已取出的快照
    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = RequestRegistry::new();
        let shared = registry.register(pending("gpt-4o"));
        let before = registry.snapshot();

        shared.write().status = RequestStatus::Complete;

        assert_eq!(before[0].status, RequestStatus::Pending);
        assert_eq!(registry.get(1).unwrap().status, RequestStatus::Complete);
        assert!(registry.get(42).is_none());
    }

    #[test]
    fn test_observer_receives_added() {
        let (registry, mut rx) = RequestRegistry::with_observer(4);
        registry.register(pending("m"));
        match rx.try_recv().unwrap() {
            RequestEvent::Added(record) => assert_eq!(record.id, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    /// 通道满时丢弃通知，不阻塞登记
    #[test]
    fn test_full_observer_channel_drops() {
        let (registry, mut rx) = RequestRegistry::with_observer(1);
        registry.register(pending("a"));
        registry.register(pending("b"));
        registry.register(pending("c"));

        assert_eq!(registry.len(), 3);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(RequestRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.register(pending("m"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 400);
        assert!(snapshot.windows(2).all(|w| w[0].id + 1 == w[1].id));
    }
}
