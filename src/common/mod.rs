//! 公共工具模块

pub mod auth;
pub mod serde_helpers;

use std::collections::BTreeMap;

use axum::http::HeaderMap;

/// 多值 header 表（按名称排序，值保持原始顺序）
pub type HeaderMultiMap = BTreeMap<String, Vec<String>>;

/// 将 HeaderMap 转换为可序列化的多值表
///
/// 非 UTF-8 的值按有损方式转换
pub fn header_multimap(headers: &HeaderMap) -> HeaderMultiMap {
    let mut map = HeaderMultiMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// 安全地截断 UTF-8 字符串，确保不会在多字节字符中间截断
///
/// 返回不超过 `max_bytes` 字节的最长有效 UTF-8 子串
pub fn truncate_str_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    // 从 max_bytes 位置向前查找有效的字符边界
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

/// 安全地截断字符串并添加省略号后缀
pub fn truncate_with_ellipsis(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    // 为省略号预留空间
    let truncate_at = if max_bytes > 3 { max_bytes - 3 } else { max_bytes };
    let truncated = truncate_str_safe(s, truncate_at);
    format!("{}...", truncated)
}

/// 请求/响应体的日志预览（二进制内容按有损 UTF-8 显示）
#[cfg(feature = "sensitive-logs")]
pub fn body_preview(body: &[u8], max_bytes: usize) -> String {
    truncate_with_ellipsis(&String::from_utf8_lossy(body), max_bytes)
}
