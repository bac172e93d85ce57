//! 请求分类与 header 处理

use axum::http::{HeaderMap, HeaderName, header};
use serde::Deserialize;

/// 需要捕获的 LLM 端点（路径后缀匹配，区分大小写）
const LLM_ENDPOINT_SUFFIXES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/messages",
    "/chat/completions",
    "/completions",
];

const ANTHROPIC_MESSAGES_SUFFIX: &str = "/v1/messages";

/// 显式跳过缓存的请求头（任意非空值）
pub const NO_CACHE_HEADER: &str = "x-no-cache";

/// 逐跳 header，不在两段连接之间转发
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_llm_endpoint(path: &str) -> bool {
    LLM_ENDPOINT_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix))
}

pub fn is_anthropic_endpoint(path: &str) -> bool {
    path.ends_with(ANTHROPIC_MESSAGES_SUFFIX)
}

/// 是否跳过缓存读写
///
/// `X-No-Cache` 任意非空值，或 `Cache-Control` 包含 no-cache / no-store（不区分大小写）
pub fn should_skip_cache(headers: &HeaderMap) -> bool {
    if headers
        .get(NO_CACHE_HEADER)
        .is_some_and(|v| !v.as_bytes().is_empty())
    {
        return true;
    }

    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .any(|v| v.contains("no-cache") || v.contains("no-store"))
}

/// 从请求体中解析的模型与流式标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub model: String,
    pub stream: bool,
}

#[derive(Deserialize)]
struct RequestPeek {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stream: Option<bool>,
}

impl RequestMeta {
    /// 尽力解析，失败时模型为 "unknown"、非流式
    pub fn parse(body: &[u8]) -> Self {
        let peek = serde_json::from_slice::<RequestPeek>(body).ok();
        let model = peek
            .as_ref()
            .and_then(|p| p.model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let stream = peek.and_then(|p| p.stream).unwrap_or(false);
        Self { model, stream }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// 去掉逐跳 header 以及 `Connection` 中列出的 header
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// 转发给上游的请求头
///
/// Host 由上游 URL 决定，Content-Length 由 HTTP 客户端按实际请求体设置
pub fn upstream_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(headers);
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out
}

/// 返回给客户端的上游响应头
pub fn client_response_headers(headers: &HeaderMap) -> HeaderMap {
    strip_hop_by_hop(headers)
}

/// 缓存命中时不回放的 header（存储的是解压后的响应体）
pub fn is_skipped_on_cache_replay(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-encoding")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_llm_endpoints() {
        assert!(is_llm_endpoint("/v1/chat/completions"));
        assert!(is_llm_endpoint("/openai/v1/chat/completions"));
        assert!(is_llm_endpoint("/v1/messages"));
        assert!(is_llm_endpoint("/v1/embeddings"));
        assert!(is_llm_endpoint("/completions"));
        assert!(!is_llm_endpoint("/v1/models"));
        assert!(!is_llm_endpoint("/v1/messages/count_tokens"));
        // 大小写敏感
        assert!(!is_llm_endpoint("/V1/Chat/Completions"));
    }

    #[test]
    fn test_anthropic_endpoint() {
        assert!(is_anthropic_endpoint("/v1/messages"));
        assert!(is_anthropic_endpoint("/anthropic/v1/messages"));
        assert!(!is_anthropic_endpoint("/v1/chat/completions"));
    }

    #[test]
    fn test_should_skip_cache() {
        let mut headers = HeaderMap::new();
        assert!(!should_skip_cache(&headers));

        headers.insert("x-no-cache", HeaderValue::from_static("1"));
        assert!(should_skip_cache(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("x-no-cache", HeaderValue::from_static(""));
        assert!(!should_skip_cache(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0, No-Cache"));
        assert!(should_skip_cache(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("NO-STORE"));
        assert!(should_skip_cache(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        assert!(!should_skip_cache(&headers));
    }

    #[test]
    fn test_request_meta_parse() {
        let meta = RequestMeta::parse(br#"{"model":"gpt-4o","stream":true,"messages":[]}"#);
        assert_eq!(meta, RequestMeta { model: "gpt-4o".to_string(), stream: true });

        let meta = RequestMeta::parse(br#"{"messages":[]}"#);
        assert_eq!(meta.model, "unknown");
        assert!(!meta.stream);

        let meta = RequestMeta::parse(b"garbage");
        assert_eq!(meta.model, "unknown");
        assert!(!meta.stream);
    }

    #[test]
    fn test_upstream_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:8080"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));

        let out = upstream_request_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out[header::AUTHORIZATION], "Bearer sk-test");
    }

    #[test]
    fn test_cache_replay_skip_list() {
        assert!(is_skipped_on_cache_replay("Content-Encoding"));
        assert!(is_skipped_on_cache_replay("content-length"));
        assert!(!is_skipped_on_cache_replay("content-type"));
    }
}
