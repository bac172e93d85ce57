//! 请求查看 API 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};

use super::router::InspectState;
use super::types::{RequestListResponse, RequestQuery, RequestSummary, StatsResponse};
use crate::capture::record::{RequestRecord, RequestStatus};
use crate::tape::CostBreakdown;

/// GET /requests
pub async fn list_requests(
    State(state): State<InspectState>,
    Query(query): Query<RequestQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(s) => match parse_status_filter(s) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": {"type": "invalid_request_error", "message": format!("无效的 status 过滤值: {}（可选 pending / complete / error）", s)}
                    })),
                )
                    .into_response();
            }
        },
    };

    let records = state.registry.snapshot();
    Json(filter_requests(&records, &query, status)).into_response()
}

/// GET /requests/{id}
pub async fn get_request(
    State(state): State<InspectState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.registry.get(id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": {"type": "not_found_error", "message": format!("请求 #{} 不存在", id)}
            })),
        )
            .into_response(),
    }
}

/// GET /stats
pub async fn get_stats(State(state): State<InspectState>) -> impl IntoResponse {
    Json(compute_stats(&state.registry.snapshot()))
}

fn parse_status_filter(s: &str) -> Option<RequestStatus> {
    match s.to_ascii_lowercase().as_str() {
        "success" => Some(RequestStatus::Complete),
        other => RequestStatus::parse(other),
    }
}

/// 过滤并分页（按 ID 倒序）
fn filter_requests(
    records: &[RequestRecord],
    query: &RequestQuery,
    status: Option<RequestStatus>,
) -> RequestListResponse {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 200);

    let matched: Vec<&RequestRecord> = records
        .iter()
        .rev()
        .filter(|r| query.model.as_deref().is_none_or(|m| r.model == m))
        .filter(|r| query.proxy.as_deref().is_none_or(|p| r.proxy_name == p))
        .filter(|r| status.is_none_or(|s| r.status == s))
        .collect();

    let offset = (page as usize - 1) * page_size as usize;
    RequestListResponse {
        total: matched.len() as u64,
        page,
        page_size,
        records: matched
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .map(RequestSummary::from)
            .collect(),
    }
}

fn compute_stats(records: &[RequestRecord]) -> StatsResponse {
    let breakdown = CostBreakdown::from_records(records);
    let finished: Vec<&RequestRecord> = records.iter().filter(|r| r.status.is_terminal()).collect();
    let error_count = records.iter().filter(|r| r.status == RequestStatus::Error).count() as u64;

    let avg_duration_ms = if finished.is_empty() {
        0.0
    } else {
        finished
            .iter()
            .map(|r| r.duration.as_secs_f64() * 1000.0)
            .sum::<f64>()
            / finished.len() as f64
    };
    let error_rate = if finished.is_empty() {
        0.0
    } else {
        error_count as f64 / finished.len() as f64
    };

    StatsResponse {
        total_requests: records.len() as u64,
        pending_count: (records.len() - finished.len()) as u64,
        error_count,
        cached_count: records.iter().filter(|r| r.cached_response).count() as u64,
        error_rate,
        avg_duration_ms,
        total_input_tokens: breakdown.total_input_tokens,
        total_output_tokens: breakdown.total_output_tokens,
        total_cost: breakdown.total_cost,
        models: breakdown.models,
    }
}
