//! 反向代理处理器
//!
//! LLM 端点的请求被捕获（缓存查询、记录、Tape），其余请求原样透传。

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Url;

use super::body::RecordingBody;
use super::endpoint::{
    RequestMeta, client_response_headers, is_llm_endpoint, is_skipped_on_cache_replay,
    should_skip_cache, upstream_request_headers,
};
use super::finalize::{Capture, CaptureGuard, CaptureServices, Exchange};
use super::record::RequestRecord;
use crate::cache::{self, CacheEntry, key::generate_cache_key};
use crate::common::header_multimap;
use crate::model::config::ProxyConfig;
use crate::pricing::estimate_input_tokens;

/// 一个监听地址到一个上游的代理实例
#[derive(Debug)]
pub struct ProxyInstance {
    pub name: String,
    pub listen: String,
    pub target: Url,
    /// 上游主机（含非默认端口）
    pub host: String,
    pub client: reqwest::Client,
}

impl ProxyInstance {
    pub fn new(config: &ProxyConfig, client: reqwest::Client) -> anyhow::Result<Self> {
        let target = Url::parse(&config.target)?;
        let host = match (target.host_str(), target.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => anyhow::bail!("target 缺少主机名: {}", config.target),
        };
        Ok(Self {
            name: config.display_name().to_string(),
            listen: config.listen.clone(),
            target,
            host,
            client,
        })
    }

    /// 上游 URL：target 去掉末尾 `/` 后拼接原始路径与查询串
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target.as_str().trim_end_matches('/'), path_and_query)
    }

    async fn send(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
        url: &str,
    ) -> reqwest::Result<reqwest::Response> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .headers(upstream_request_headers(headers));
        if !body.is_empty() {
            request = request.body(body);
        }
        request.send().await
    }
}

/// 代理处理器状态
#[derive(Clone)]
pub struct ProxyState {
    pub instance: Arc<ProxyInstance>,
    pub services: Arc<CaptureServices>,
}

/// 所有路径的入口
pub async fn proxy_handler(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let upstream_url = state.instance.upstream_url(&path_and_query);

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("[{}] 读取请求体失败: {}", state.instance.name, e);
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    if !is_llm_endpoint(&path) {
        return passthrough(&state, &parts.method, &parts.headers, body, &upstream_url).await;
    }

    #[cfg(feature = "sensitive-logs")]
    tracing::debug!(
        "[{}] {} {} 请求体: {}",
        state.instance.name,
        parts.method,
        path,
        crate::common::body_preview(&body, 2048)
    );

    let services = &state.services;
    let meta = RequestMeta::parse(&body);
    // 流式请求与显式跳过缓存的请求既不查缓存也不写缓存
    let cacheable = !meta.stream && !should_skip_cache(&parts.headers);
    let cache_key = cacheable.then(|| generate_cache_key(&path, &body));
    let cached = match &cache_key {
        Some(key) => cache::lookup(&services.cache, key).await,
        None => None,
    };

    let record = RequestRecord {
        method: parts.method.to_string(),
        path,
        host: state.instance.host.clone(),
        url: upstream_url.clone(),
        model: meta.model,
        start_time: Utc::now(),
        request_headers: header_multimap(&parts.headers),
        request_size: body.len(),
        request_body: body.clone(),
        is_streaming: meta.stream,
        estimated_input_tokens: estimate_input_tokens(body.len()),
        provider_id: services
            .pricing
            .provider_for_url(&upstream_url)
            .unwrap_or_default(),
        cached_response: cached.is_some(),
        proxy_name: state.instance.name.clone(),
        proxy_listen: state.instance.listen.clone(),
        ..Default::default()
    };

    if let Some(entry) = cached {
        let mut guard = CaptureGuard::new(Capture::begin(services.clone(), record, None));
        return replay_cached(services, &mut guard, entry).await;
    }

    let mut guard = CaptureGuard::new(Capture::begin(services.clone(), record, cache_key));

    let upstream = match state
        .instance
        .send(&parts.method, &parts.headers, body, &upstream_url)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("[{}] 上游请求失败 {}: {}", state.instance.name, upstream_url, e);
            guard.complete(Exchange {
                status_code: StatusCode::BAD_GATEWAY.as_u16(),
                ..Default::default()
            });
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let recorded_headers = header_multimap(&upstream_headers);
    let expected_len = upstream.content_length();

    let bodyless = status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || parts.method == Method::HEAD
        || expected_len == Some(0);

    let body = if bodyless {
        let bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("[{}] 读取上游响应失败: {}", state.instance.name, e);
                Bytes::new()
            }
        };
        guard.complete(Exchange {
            status_code: status.as_u16(),
            headers: recorded_headers,
            body: bytes.clone(),
            ttft: Some(guard.elapsed()),
            from_cache: false,
        });
        Body::from(bytes)
    } else {
        Body::from_stream(RecordingBody::new(
            upstream.bytes_stream().boxed(),
            guard,
            status.as_u16(),
            recorded_headers,
            expected_len,
        ))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = client_response_headers(&upstream_headers);
    response
}

/// 回放缓存条目，按需模拟原始耗时
async fn replay_cached(
    services: &CaptureServices,
    guard: &mut CaptureGuard,
    entry: CacheEntry,
) -> Response {
    if services.simulate_latency && !entry.duration.is_zero() {
        tokio::time::sleep(entry.duration).await;
    }

    let status = StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    for (name, values) in &entry.response_headers {
        if is_skipped_on_cache_replay(name) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.response_body.len()));

    let body = entry.response_body.clone();
    guard.complete(Exchange {
        status_code: entry.status_code,
        headers: entry.response_headers,
        body: entry.response_body,
        ttft: None,
        from_cache: true,
    });

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// 非 LLM 端点：不记录，原样转发
async fn passthrough(
    state: &ProxyState,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    upstream_url: &str,
) -> Response {
    match state.instance.send(method, headers, body, upstream_url).await {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = client_response_headers(upstream.headers());
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
        }
        Err(e) => {
            tracing::warn!("[{}] 透传请求失败 {}: {}", state.instance.name, upstream_url, e);
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
