//! 请求收尾
//!
//! 每个被捕获的请求恰好收尾一次。正常完成、上游失败与客户端断开竞争同一个原子标记，
//! 只有赢家写入终态并触发缓存写入、Tape 事件与观察者通知。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;

use super::body::decompress_if_gzip;
use super::record::{RequestRecord, RequestStatus};
use super::registry::{RequestEvent, RequestRegistry, SharedRecord};
use crate::cache::{self, CacheEntry, CacheStore};
use crate::common::HeaderMultiMap;
use crate::pricing::{PricingLookup, calculate_cost};
use crate::tape::TapeWriter;
use crate::usage::extract_token_usage;

/// 客户端在响应结束前断开时记录的状态码
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// 所有代理实例共享的捕获依赖
pub struct CaptureServices {
    pub registry: Arc<RequestRegistry>,
    pub cache: Arc<dyn CacheStore>,
    /// 缓存命中时按原始耗时等待
    pub simulate_latency: bool,
    pub tape: Option<TapeWriter>,
    pub pricing: Arc<dyn PricingLookup>,
    /// token 补全后追加 request_update 事件
    pub record_usage_updates: bool,
}

/// 一次完整的响应
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub status_code: u16,
    pub headers: HeaderMultiMap,
    /// 发给客户端的原始字节（可能是 gzip）
    pub body: Bytes,
    pub ttft: Option<Duration>,
    pub from_cache: bool,
}

#[derive(Debug)]
pub enum Outcome {
    Completed(Exchange),
    /// 上游响应体中途出错，只收到部分内容
    UpstreamAborted(Exchange),
    ClientCancelled,
}

struct CaptureInner {
    record: SharedRecord,
    services: Arc<CaptureServices>,
    /// 可缓存时的缓存键
    cache_key: Option<String>,
    started: Instant,
    finalized: AtomicBool,
}

/// 正在进行的被捕获请求
#[derive(Clone)]
pub struct Capture {
    inner: Arc<CaptureInner>,
}

impl Capture {
    /// 登记请求并写入 request_start
    pub fn begin(
        services: Arc<CaptureServices>,
        record: RequestRecord,
        cache_key: Option<String>,
    ) -> Self {
        let started = Instant::now();
        let record = services.registry.register(record);
        if let Some(tape) = &services.tape {
            tape.request_start(&record.read());
        }
        Self {
            inner: Arc::new(CaptureInner {
                record,
                services,
                cache_key,
                started,
                finalized: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.record.read().id
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// 收尾，只有第一次调用生效，返回本次调用是否生效
    pub fn finalize(&self, outcome: Outcome) -> bool {
        if self
            .inner
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let duration = self.elapsed();
        match outcome {
            Outcome::ClientCancelled => {
                let snapshot = {
                    let mut record = self.inner.record.write();
                    record.status = RequestStatus::Error;
                    record.status_code = CLIENT_CLOSED_REQUEST;
                    record.duration = duration;
                    record.clone()
                };
                tracing::debug!("#{} 客户端提前断开", snapshot.id);
                self.publish_complete(snapshot);
            }
            Outcome::Completed(exchange) => self.record_exchange(exchange, duration, false),
            Outcome::UpstreamAborted(exchange) => self.record_exchange(exchange, duration, true),
        }
        true
    }

    /// 写入响应；中途中断的响应记为 Error 且不缓存
    fn record_exchange(&self, exchange: Exchange, duration: Duration, aborted: bool) {
        let stored_body = decompress_if_gzip(&exchange.headers, exchange.body.clone());
        let status = if aborted {
            RequestStatus::Error
        } else {
            RequestStatus::from_status_code(exchange.status_code)
        };
        let snapshot = {
            let mut record = self.inner.record.write();
            record.status = status;
            record.status_code = exchange.status_code;
            record.duration = duration;
            record.ttft = exchange.ttft;
            record.response_headers = exchange.headers.clone();
            record.response_body = stored_body.clone();
            record.response_size = exchange.body.len();
            record.clone()
        };

        if status == RequestStatus::Complete && !exchange.from_cache {
            if let Some(key) = &self.inner.cache_key {
                cache::store_in_background(
                    &self.inner.services.cache,
                    key.clone(),
                    CacheEntry {
                        response_body: stored_body.clone(),
                        response_headers: exchange.headers,
                        status_code: exchange.status_code,
                        duration,
                        created_at: Utc::now(),
                    },
                );
            }
        }

        self.publish_complete(snapshot);
        if !stored_body.is_empty() {
            self.spawn_usage_extraction(stored_body);
        }
    }

    fn publish_complete(&self, snapshot: RequestRecord) {
        let services = &self.inner.services;
        if let Some(tape) = &services.tape {
            tape.request_complete(&snapshot);
        }
        services.registry.notify(RequestEvent::Updated(snapshot));
    }

    /// 在阻塞线程池中解析 token 用量，不在运行时内时同步执行
    fn spawn_usage_extraction(&self, body: Bytes) {
        let capture = self.clone();
        let job = move || capture.apply_usage(&body);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    fn apply_usage(&self, body: &[u8]) {
        let usage = match extract_token_usage(body) {
            Ok(usage) => usage,
            Err(e) => {
                tracing::debug!("#{} 未提取到 token 用量: {}", self.id(), e);
                return;
            }
        };
        if usage.is_empty() {
            return;
        }

        let services = &self.inner.services;
        let (model, provider_id) = {
            let record = self.inner.record.read();
            (record.model.clone(), record.provider_id.clone())
        };
        let provider = Some(provider_id.as_str()).filter(|p| !p.is_empty());
        let model_cost = services.pricing.model_cost(provider, &model);
        let cost = calculate_cost(model_cost.as_ref(), usage.input_tokens, usage.output_tokens);

        let snapshot = {
            let mut record = self.inner.record.write();
            record.input_tokens = usage.input_tokens;
            record.output_tokens = usage.output_tokens;
            record.cost = cost;
            record.clone()
        };

        if services.record_usage_updates {
            if let Some(tape) = &services.tape {
                tape.request_update(&snapshot);
            }
        }
        services.registry.notify(RequestEvent::Updated(snapshot));
    }
}

/// 收尾守卫
///
/// 在完成前被丢弃（客户端断开导致 handler 或响应流被取消）时以 499 收尾
pub struct CaptureGuard {
    capture: Option<Capture>,
}

impl CaptureGuard {
    pub fn new(capture: Capture) -> Self {
        Self {
            capture: Some(capture),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.capture
            .as_ref()
            .map(Capture::elapsed)
            .unwrap_or_default()
    }

    /// 以完整响应收尾，之后守卫不再生效
    pub fn complete(&mut self, exchange: Exchange) -> bool {
        self.finish(Outcome::Completed(exchange))
    }

    /// 以中途中断的上游响应收尾
    pub fn abort(&mut self, exchange: Exchange) -> bool {
        self.finish(Outcome::UpstreamAborted(exchange))
    }

    fn finish(&mut self, outcome: Outcome) -> bool {
        self.capture
            .take()
            .is_some_and(|capture| capture.finalize(outcome))
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.finalize(Outcome::ClientCancelled);
        }
    }
}
