//! 请求查看 API 请求/响应类型

use serde::{Deserialize, Serialize};

use crate::capture::record::RequestRecord;
use crate::tape::cost::ModelCostSummary;

/// 查询过滤器
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub model: Option<String>,
    /// pending / complete / error
    pub status: Option<String>,
    /// 代理实例名称
    pub proxy: Option<String>,
}

/// 分页响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestListResponse {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub records: Vec<RequestSummary>,
}

/// 列表中的单条记录（不含请求/响应体）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: u64,
    pub timestamp: String,
    pub proxy: String,
    pub method: String,
    pub path: String,
    pub model: String,
    pub status: &'static str,
    pub status_code: u16,
    pub stream: bool,
    pub cached: bool,
    pub duration_ms: u64,
    pub ttft_ms: Option<u64>,
    pub request_size: usize,
    pub response_size: usize,
    pub estimated_input_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl From<&RequestRecord> for RequestSummary {
    fn from(record: &RequestRecord) -> Self {
        Self {
            id: record.id,
            timestamp: record.start_time.to_rfc3339(),
            proxy: record.proxy_name.clone(),
            method: record.method.clone(),
            path: record.path.clone(),
            model: record.model.clone(),
            status: record.status.as_str(),
            status_code: record.status_code,
            stream: record.is_streaming,
            cached: record.cached_response,
            duration_ms: record.duration.as_millis() as u64,
            ttft_ms: record.ttft.map(|t| t.as_millis() as u64),
            request_size: record.request_size,
            response_size: record.response_size,
            estimated_input_tokens: record.estimated_input_tokens,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            cost: record.cost,
        }
    }
}

/// 统计响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_requests: u64,
    pub pending_count: u64,
    pub error_count: u64,
    pub cached_count: u64,
    pub error_rate: f64,
    pub avg_duration_ms: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub models: Vec<ModelCostSummary>,
}
