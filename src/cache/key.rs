//! 缓存键生成
//!
//! 只取请求体中决定响应内容的字段（按方言区分），固定顺序序列化后做 SHA-256，
//! 再拼接请求路径。鉴权头、请求 ID、客户端扩展字段都不参与计算。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::capture::endpoint::is_anthropic_endpoint;

/// Anthropic 消息
#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Value,
}

/// Anthropic `/v1/messages` 请求中参与缓存键的字段
#[derive(Debug, Serialize, Deserialize)]
struct AnthropicKeyFields {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    system: Option<Value>,
    #[serde(default)]
    max_tokens: i64,
    #[serde(default)]
    stream: bool,
}

/// OpenAI 风格消息
#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// OpenAI 风格请求中参与缓存键的字段
#[derive(Debug, Serialize, Deserialize)]
struct OpenAiKeyFields {
    #[serde(default)]
    model: String,
    #[serde(default)]
    messages: Vec<OpenAiMessage>,
    #[serde(default)]
    temperature: f64,
    #[serde(default)]
    max_tokens: i64,
    #[serde(default)]
    stream: bool,
}

/// 生成缓存键：`<path>:<sha256 hex>`
///
/// 请求体无法按方言解析时，对原始字节做哈希
pub fn generate_cache_key(path: &str, body: &[u8]) -> String {
    let normalized = if is_anthropic_endpoint(path) {
        normalize::<AnthropicKeyFields>(body)
    } else {
        normalize::<OpenAiKeyFields>(body)
    };

    let digest = match &normalized {
        Some(bytes) => sha256_hex(bytes),
        None => {
            tracing::debug!("请求体无法解析，按原始字节计算缓存键: {}", path);
            sha256_hex(body)
        }
    };

    format!("{}:{}", path, digest)
}

/// 解析为方言子集后重新序列化
///
/// `serde_json::Value` 的对象按键排序输出，嵌套内容的序列化结果是确定的
fn normalize<T>(body: &[u8]) -> Option<Vec<u8>>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    let fields: T = serde_json::from_slice(body).ok()?;
    serde_json::to_vec(&fields).ok()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: &str = "/v1/chat/completions";
    const MESSAGES: &str = "/v1/messages";

    #[test]
    fn test_identical_inputs_same_key() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        assert_eq!(generate_cache_key(CHAT, body), generate_cache_key(CHAT, body));
    }

    #[test]
    fn test_key_format() {
        let key = generate_cache_key(CHAT, br#"{"model":"gpt-4o"}"#);
        let (path, digest) = key.rsplit_once(':').unwrap();
        assert_eq!(path, CHAT);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_messages_change_key() {
        let a = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#;
        let b = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"bye"}]}"#;
        assert_ne!(generate_cache_key(CHAT, a), generate_cache_key(CHAT, b));
    }

    #[test]
    fn test_anthropic_system_changes_key() {
        let base = br#"{"model":"claude-sonnet-4","max_tokens":1024,"messages":[{"role":"user","content":"hi"}]}"#;
        let with_system = br#"{"model":"claude-sonnet-4","max_tokens":1024,"system":"be brief","messages":[{"role":"user","content":"hi"}]}"#;
        let other_system = br#"{"model":"claude-sonnet-4","max_tokens":1024,"system":"be verbose","messages":[{"role":"user","content":"hi"}]}"#;

        let k1 = generate_cache_key(MESSAGES, base);
        let k2 = generate_cache_key(MESSAGES, with_system);
        let k3 = generate_cache_key(MESSAGES, other_system);
        assert_ne!(k1, k2);
        assert_ne!(k2, k3);
    }

    /// 与响应无关的字段（元数据、字段顺序、空白）不影响缓存键
    #[test]
    fn test_volatile_fields_ignored() {
        let a = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"user":"u-1","metadata":{"trace":"abc"}}"#;
        let b = br#"{ "messages": [{"content":"hi","role":"user"}], "model": "gpt-4o", "user": "u-2" }"#;
        assert_eq!(generate_cache_key(CHAT, a), generate_cache_key(CHAT, b));
    }

    #[test]
    fn test_temperature_only_counts_for_openai() {
        let a = br#"{"model":"m","messages":[],"temperature":0.2}"#;
        let b = br#"{"model":"m","messages":[],"temperature":0.9}"#;
        assert_ne!(generate_cache_key(CHAT, a), generate_cache_key(CHAT, b));
        assert_eq!(generate_cache_key(MESSAGES, a), generate_cache_key(MESSAGES, b));
    }

    #[test]
    fn test_path_is_part_of_key() {
        let body = br#"{"model":"gpt-4o","messages":[]}"#;
        assert_ne!(
            generate_cache_key("/v1/chat/completions", body),
            generate_cache_key("/chat/completions", body)
        );
    }

    /// 非 JSON 请求体回退为原始字节哈希
    #[test]
    fn test_unparseable_body_falls_back_to_raw_hash() {
        let body = b"not json at all";
        let key = generate_cache_key(CHAT, body);
        assert_eq!(key, format!("{}:{}", CHAT, sha256_hex(body)));
        assert_eq!(key, generate_cache_key(CHAT, body));
        assert_ne!(key, generate_cache_key(CHAT, b"not json at all!"));
    }
}
