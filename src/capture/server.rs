//! 代理实例的路由与监听

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::finalize::CaptureServices;
use super::handler::{ProxyInstance, ProxyState, proxy_handler};

/// 创建代理路由：所有方法与路径都交给 [`proxy_handler`]
pub fn create_proxy_router(instance: Arc<ProxyInstance>, services: Arc<CaptureServices>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .with_state(ProxyState { instance, services })
}

/// 在已绑定的监听器上运行代理，直到收到关闭信号
pub async fn serve_proxy(
    listener: TcpListener,
    instance: Arc<ProxyInstance>,
    services: Arc<CaptureServices>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let name = instance.name.clone();
    let target = instance.target.to_string();
    let local = listener.local_addr()?;
    tracing::info!("[{}] 代理已启动: http://{} -> {}", name, local, target);

    let app = create_proxy_router(instance, services);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    tracing::info!("[{}] 代理已停止", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::generate_cache_key;
    use crate::cache::{CacheEntry, CacheStore, DisabledCache, MemoryCache};
    use crate::capture::finalize::tests::services_with;
    use crate::capture::record::RequestStatus;
    use crate::model::config::ProxyConfig;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SSE_BODY: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":15}}\n\n",
    );

    /// 本地上游：记录 /v1/chat/completions 的调用次数
    async fn spawn_upstream(calls: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route("/v1/models", get(|| async { "{\"data\":[]}" }))
            .route(
                "/v1/chat/completions",
                post(move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        (
                            [("content-type", "application/json")],
                            r#"{"id":"c1","usage":{"prompt_tokens":12,"completion_tokens":7}}"#,
                        )
                    }
                }),
            )
            .route(
                "/v1/messages",
                post(|| async { ([("content-type", "text/event-stream")], SSE_BODY) }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn spawn_proxy(target: &str, services: Arc<CaptureServices>) -> String {
        let config = ProxyConfig {
            name: "test".to_string(),
            listen: "127.0.0.1:0".to_string(),
            target: target.to_string(),
        };
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let instance = Arc::new(ProxyInstance::new(&config, client).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            // 发送端随任务存活，否则关闭信号立即触发
            let _shutdown = tx;
            serve_proxy(listener, instance, services, rx).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待条件超时");
    }

    #[tokio::test]
    async fn test_non_llm_path_passes_through_unrecorded() {
        let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let services = services_with(Arc::new(DisabledCache));
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let response = client().get(format!("{}/v1/models", proxy)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "{\"data\":[]}");
        assert!(services.registry.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_unreachable_is_bad_gateway() {
        let services = services_with(Arc::new(DisabledCache));
        let proxy = spawn_proxy("http://127.0.0.1:1", services.clone()).await;

        let response = client()
            .post(format!("{}/v1/chat/completions", proxy))
            .body(r#"{"model":"gpt-4o","messages":[]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let record = services.registry.get(1).unwrap();
        assert_eq!(record.status, RequestStatus::Error);
        assert_eq!(record.status_code, 502);
        assert_eq!(record.model, "gpt-4o");
        assert_eq!(record.host, "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_json_request_recorded_with_usage() {
        let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let services = services_with(Arc::new(DisabledCache));
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let response = client()
            .post(format!("{}/v1/chat/completions?trace=1", proxy))
            .header("content-type", "application/json")
            .body(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.text().await.unwrap();

        wait_until(|| services.registry.get(1).is_some_and(|r| r.output_tokens == 7)).await;
        let record = services.registry.get(1).unwrap();
        assert_eq!(record.status, RequestStatus::Complete);
        assert_eq!(record.input_tokens, 12);
        assert_eq!(record.path, "/v1/chat/completions");
        assert!(record.url.ends_with("/v1/chat/completions?trace=1"));
        assert!(!record.cached_response);
        assert!(record.ttft.is_some());
    }

    #[tokio::test]
    async fn test_streaming_response_forwarded_and_parsed() {
        let upstream = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let services = services_with(Arc::new(DisabledCache));
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let response = client()
            .post(format!("{}/v1/messages", proxy))
            .body(r#"{"model":"claude-sonnet-4","stream":true,"max_tokens":64,"messages":[]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), SSE_BODY);

        wait_until(|| services.registry.get(1).is_some_and(|r| r.output_tokens == 15)).await;
        let record = services.registry.get(1).unwrap();
        assert!(record.is_streaming);
        assert_eq!(record.input_tokens, 25);
        assert_eq!(record.response_body, bytes::Bytes::from_static(SSE_BODY.as_bytes()));
    }

    /// 第二次相同请求命中缓存，上游只被调用一次
    #[tokio::test]
    async fn test_second_identical_request_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream = spawn_upstream(calls.clone()).await;
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let services = services_with(cache.clone());
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        let key = generate_cache_key("/v1/chat/completions", body.as_bytes());

        let first = client()
            .post(format!("{}/v1/chat/completions", proxy))
            .body(body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        wait_until(|| cache.get(&key).ok().flatten().is_some()).await;

        let second = client()
            .post(format!("{}/v1/chat/completions", proxy))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(
            second.headers()["content-length"],
            first.len().to_string().as_str()
        );
        assert_eq!(second.text().await.unwrap(), first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let record = services.registry.get(2).unwrap();
        assert!(record.cached_response);
        assert_eq!(record.status, RequestStatus::Complete);
        assert_eq!(record.response_body, services.registry.get(1).unwrap().response_body);

        // X-No-Cache 强制访问上游
        client()
            .post(format!("{}/v1/chat/completions", proxy))
            .header("x-no-cache", "1")
            .body(body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!services.registry.get(3).unwrap().cached_response);
    }

    /// 流式请求既不读缓存也不写缓存
    #[tokio::test]
    async fn test_streaming_request_bypasses_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream = spawn_upstream(calls.clone()).await;
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let services = services_with(cache.clone());
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let body = r#"{"model":"gpt-4o","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let key = generate_cache_key("/v1/chat/completions", body.as_bytes());
        let stale = CacheEntry {
            response_body: bytes::Bytes::from_static(b"stale"),
            response_headers: Default::default(),
            status_code: 200,
            duration: Duration::ZERO,
            created_at: chrono::Utc::now(),
        };
        cache.set(&key, stale.clone()).unwrap();

        for _ in 0..2 {
            let text = client()
                .post(format!("{}/v1/chat/completions", proxy))
                .body(body)
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap();
            assert_ne!(text, "stale");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        wait_until(|| services.registry.get(2).is_some_and(|r| r.status.is_terminal())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!services.registry.get(1).unwrap().cached_response);
        assert!(!services.registry.get(2).unwrap().cached_response);
        // 预置的条目未被覆盖
        assert_eq!(cache.get(&key).unwrap().unwrap().response_body, stale.response_body);
    }

    /// Cache-Control: no-store 的请求不写缓存
    #[tokio::test]
    async fn test_no_store_request_not_written_to_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream = spawn_upstream(calls.clone()).await;
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let services = services_with(cache.clone());
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"no store"}]}"#;
        let key = generate_cache_key("/v1/chat/completions", body.as_bytes());

        client()
            .post(format!("{}/v1/chat/completions", proxy))
            .header("cache-control", "No-Store")
            .body(body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        wait_until(|| services.registry.get(1).is_some_and(|r| r.status.is_terminal())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get(&key).unwrap().is_none());

        // 不带跳过标记的相同请求仍然访问上游
        client()
            .post(format!("{}/v1/chat/completions", proxy))
            .body(body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!services.registry.get(2).unwrap().cached_response);
    }

    /// 上游声明 Content-Length: 100 却只发送 10 字节后断开
    async fn spawn_truncating_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        request.extend_from_slice(&buf[..n]);
                        if request_complete(&request) {
                            break;
                        }
                    }
                    let response = concat!(
                        "HTTP/1.1 200 OK\r\n",
                        "content-type: application/json\r\n",
                        "content-length: 100\r\n",
                        "\r\n",
                        "{\"partial\"",
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    /// 请求头与 Content-Length 指定的请求体都已读完
    fn request_complete(request: &[u8]) -> bool {
        let Some(header_end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let body_len = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + body_len
    }

    /// 上游响应体被截断：记为 Error，不写缓存
    #[tokio::test]
    async fn test_truncated_upstream_body_not_cached() {
        let upstream = spawn_truncating_upstream().await;
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let services = services_with(cache.clone());
        let proxy = spawn_proxy(&upstream, services.clone()).await;

        let body = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"cut"}]}"#;
        let key = generate_cache_key("/v1/chat/completions", body.as_bytes());

        if let Ok(response) = client()
            .post(format!("{}/v1/chat/completions", proxy))
            .body(body)
            .send()
            .await
        {
            let _ = response.bytes().await;
        }

        wait_until(|| services.registry.get(1).is_some_and(|r| r.status.is_terminal())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let record = services.registry.get(1).unwrap();
        assert_eq!(record.status, RequestStatus::Error);
        assert!(cache.get(&key).unwrap().is_none());
    }
}
