//! 请求查看 API 路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::capture::registry::RequestRegistry;
use crate::common::auth;

use super::handlers::{get_request, get_stats, list_requests};

/// 请求查看 API 状态
#[derive(Clone)]
pub struct InspectState {
    pub api_key: String,
    pub registry: Arc<RequestRegistry>,
}

/// API Key 认证中间件
async fn inspect_auth_middleware(
    State(state): State<InspectState>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response {
    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, &state.api_key) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })),
        )
            .into_response(),
    }
}

/// CORS 中间件层（允许任意来源，API 本身需要 API Key）
fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 创建请求查看 API 路由
pub fn create_inspect_router(api_key: impl Into<String>, registry: Arc<RequestRegistry>) -> Router {
    let state = InspectState {
        api_key: api_key.into(),
        registry,
    };

    Router::new()
        .route("/requests", get(list_requests))
        .route("/requests/{id}", get(get_request))
        .route("/stats", get(get_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inspect_auth_middleware,
        ))
        .layer(cors_layer())
        .with_state(state)
}

/// 运行请求查看 API，直到收到关闭信号
pub async fn serve_inspect(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    tracing::info!("请求查看 API 已启动: http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}
