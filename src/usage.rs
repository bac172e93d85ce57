//! Token 用量提取
//!
//! 支持两种响应形态：
//! - 普通 JSON：顶层 `usage` 对象，兼容 OpenAI（prompt/completion）与 Anthropic（input/output）字段名
//! - SSE：逐行读取 `data:` 事件，Anthropic 的 `message_start` / `message_delta`
//!   以及 OpenAI 流末尾携带 `usage` 的 chunk
//!
//! 提取是尽力而为的：调用方拿到错误时保持 token 与费用为 0。

use serde::Deserialize;

/// 提取到的 token 数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("响应体为空")]
    EmptyBody,
    #[error("响应体不是合法 JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("响应中没有 usage 信息")]
    NotFound,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct UsageEnvelope {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

/// SSE 事件中关心的字段
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// 从最终响应体中提取 token 用量
pub fn extract_token_usage(body: &[u8]) -> Result<TokenUsage, UsageError> {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(UsageError::EmptyBody);
    }

    if is_sse(trimmed) {
        extract_from_sse(trimmed)
    } else {
        extract_from_json(trimmed)
    }
}

fn is_sse(trimmed: &str) -> bool {
    trimmed.starts_with("event:") || trimmed.starts_with("data:")
}

fn extract_from_json(text: &str) -> Result<TokenUsage, UsageError> {
    let envelope: UsageEnvelope = serde_json::from_str(text)?;
    let usage = envelope.usage.ok_or(UsageError::NotFound)?;

    // 每个字段取第一个非零值：OpenAI 字段优先
    let input_tokens = first_non_zero(usage.prompt_tokens, usage.input_tokens);
    let output_tokens = first_non_zero(usage.completion_tokens, usage.output_tokens);
    Ok(TokenUsage {
        input_tokens,
        output_tokens,
    })
}

fn first_non_zero(a: u64, b: u64) -> u64 {
    if a > 0 { a } else { b }
}

fn extract_from_sse(text: &str) -> Result<TokenUsage, UsageError> {
    let mut usage = TokenUsage::default();
    let mut seen_usage = false;

    for line in text.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }

        // 单个事件解析失败不影响其余事件
        let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
            continue;
        };

        match event.event_type.as_str() {
            "message_start" => {
                if let Some(u) = event.message.and_then(|m| m.usage) {
                    if u.input_tokens > 0 {
                        usage.input_tokens = u.input_tokens;
                        seen_usage = true;
                    }
                }
            }
            "message_delta" => {
                if let Some(u) = &event.usage {
                    if u.output_tokens > 0 {
                        usage.output_tokens = u.output_tokens;
                        seen_usage = true;
                    }
                }
            }
            _ => {}
        }

        // OpenAI 风格 chunk（通常是最后一个，需要客户端开启 stream_options.include_usage）
        if let Some(u) = &event.usage {
            if u.prompt_tokens > 0 {
                usage.input_tokens = u.prompt_tokens;
                seen_usage = true;
            }
            if u.completion_tokens > 0 {
                usage.output_tokens = u.completion_tokens;
                seen_usage = true;
            }
        }
    }

    if seen_usage {
        Ok(usage)
    } else {
        Err(UsageError::NotFound)
    }
}
