//! 请求记录数据模型

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

use crate::common::HeaderMultiMap;
use crate::common::serde_helpers::{base64_bytes, duration_nanos, option_duration_nanos};

/// 请求生命周期状态
///
/// 只允许 `Pending -> Complete | Error` 一次转换。序列化为整数（0/1/2）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum RequestStatus {
    #[default]
    Pending,
    Complete,
    Error,
}

impl RequestStatus {
    pub fn code(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Complete => 1,
            RequestStatus::Error => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RequestStatus::Pending),
            1 => Some(RequestStatus::Complete),
            2 => Some(RequestStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Complete => "complete",
            RequestStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(RequestStatus::Pending),
            "complete" => Some(RequestStatus::Complete),
            "error" => Some(RequestStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RequestStatus::Pending
    }

    /// 按 HTTP 状态码分类：2xx 为完成，其余为错误
    pub fn from_status_code(status_code: u16) -> Self {
        if (200..300).contains(&status_code) {
            RequestStatus::Complete
        } else {
            RequestStatus::Error
        }
    }
}

impl Serialize for RequestStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for RequestStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        RequestStatus::from_code(code)
            .ok_or_else(|| D::Error::custom(format!("未知的请求状态: {}", code)))
    }
}

/// 一次被捕获的请求/响应
///
/// 字段名与 Tape 文件中的 JSON 键一致，解码时所有字段都有默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestRecord {
    pub id: u64,
    pub method: String,
    pub path: String,
    /// 上游主机
    pub host: String,
    pub url: String,
    pub model: String,
    pub status: RequestStatus,
    pub status_code: u16,
    pub start_time: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// 首字节时间
    #[serde(with = "option_duration_nanos", skip_serializing_if = "Option::is_none")]
    pub ttft: Option<Duration>,
    pub request_headers: HeaderMultiMap,
    pub response_headers: HeaderMultiMap,
    #[serde(with = "base64_bytes", skip_serializing_if = "Bytes::is_empty")]
    pub request_body: Bytes,
    /// 响应体（gzip 已解压）
    #[serde(with = "base64_bytes", skip_serializing_if = "Bytes::is_empty")]
    pub response_body: Bytes,
    pub request_size: usize,
    /// 发给客户端的原始字节数
    pub response_size: usize,
    pub is_streaming: bool,
    pub estimated_input_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
    pub cost: f64,
    pub cached_response: bool,
    pub proxy_name: String,
    pub proxy_listen: String,
}

impl RequestRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// 清空响应侧字段后的副本（用于导出 request_start 事件）
    pub fn as_pending(&self) -> RequestRecord {
        RequestRecord {
            status: RequestStatus::Pending,
            status_code: 0,
            duration: Duration::ZERO,
            ttft: None,
            response_headers: HeaderMultiMap::new(),
            response_body: Bytes::new(),
            response_size: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            ..self.clone()
        }
    }

    /// 完成时刻（开始时间 + 耗时）
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + chrono::TimeDelta::from_std(self.duration).unwrap_or(chrono::TimeDelta::zero())
    }
}
