//! Tape 事件格式
//!
//! 每行一个 JSON 对象：`{"timestamp", "type", "seq", "data"}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tape 格式版本
pub const TAPE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeEventType {
    SessionStart,
    RequestStart,
    RequestUpdate,
    RequestComplete,
    SessionEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapeEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: TapeEventType,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default)]
    pub data: Value,
}

/// session_start 事件的数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapeSession {
    pub listen_addr: String,
    pub target_url: String,
    pub start_time: DateTime<Utc>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TapeError {
    #[error("Tape 文件读写失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("Tape 事件编码失败: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Tape 写入任务已停止")]
    Closed,
}
