use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 缓存模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// 不缓存
    #[default]
    None,
    /// 进程内存缓存，重启后丢失
    Memory,
    /// 磁盘持久化缓存，多个代理实例共享
    Global,
}

impl std::str::FromStr for CacheMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" | "" => Ok(Self::None),
            "memory" => Ok(Self::Memory),
            "global" | "disk" => Ok(Self::Global),
            other => anyhow::bail!("未知的缓存模式: {}（可选 none / memory / global）", other),
        }
    }
}

/// 单个代理实例配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// 实例名称（为空时使用 listen）
    #[serde(default)]
    pub name: String,
    /// 监听地址，例如 `127.0.0.1:8080`
    pub listen: String,
    /// 上游地址，例如 `https://api.openai.com`
    pub target: String,
}

impl ProxyConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.listen
        } else {
            &self.name
        }
    }
}

/// 响应缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default)]
    pub mode: CacheMode,

    /// 缓存有效期，格式为数字加单位（s/m/h/d），例如 "24h"、"7d"
    #[serde(default = "default_cache_ttl")]
    pub ttl: String,

    /// 命中缓存时按原始耗时延迟返回
    #[serde(default)]
    pub simulate_latency: bool,

    /// 持久化缓存目录（仅 global 模式），默认 ~/.llmproxy-cache
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

fn default_cache_ttl() -> String {
    "24h".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::None,
            ttl: default_cache_ttl(),
            simulate_latency: false,
            dir: None,
        }
    }
}

impl CacheConfig {
    /// 解析后的 TTL
    pub fn ttl_duration(&self) -> anyhow::Result<Duration> {
        parse_ttl(&self.ttl)
    }

    /// 持久化缓存目录
    pub fn effective_dir(&self) -> PathBuf {
        match self.dir.as_deref() {
            Some(dir) if !dir.is_empty() => expand_home(dir),
            _ => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".llmproxy-cache"),
        }
    }
}

/// 模型价格目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingConfig {
    #[serde(default = "default_pricing_enabled")]
    pub enabled: bool,

    #[serde(default = "default_pricing_url")]
    pub url: String,
}

fn default_pricing_enabled() -> bool {
    true
}

fn default_pricing_url() -> String {
    "https://models.dev/api.json".to_string()
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            enabled: default_pricing_enabled(),
            url: default_pricing_url(),
        }
    }
}

/// 请求查看 API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectConfig {
    pub listen: String,
    pub api_key: String,
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_proxies")]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    /// 实时录制 Tape 的文件路径（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_tape: Option<String>,

    /// 退出时导出整个会话到 Tape 的文件路径（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_tape: Option<String>,

    /// Token 用量补全后追加 request_update 事件
    #[serde(default)]
    pub record_usage_updates: bool,

    /// 上游请求超时（秒），未配置时使用 HTTP 客户端默认行为
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_timeout_secs: Option<u64>,

    /// HTTP 代理地址（可选）
    /// 支持格式: http://host:port, https://host:port, socks5://host:port
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    #[serde(default)]
    pub pricing: PricingConfig,

    /// 请求查看 API（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect: Option<InspectConfig>,

    /// 观察者通知通道容量，满时丢弃通知
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,

    /// 配置文件路径（运行时元数据，不写入 JSON）
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_proxies() -> Vec<ProxyConfig> {
    vec![ProxyConfig {
        name: "default".to_string(),
        listen: "127.0.0.1:8080".to_string(),
        target: "https://api.openai.com".to_string(),
    }]
}

fn default_observer_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxies: default_proxies(),
            cache: CacheConfig::default(),
            record_tape: None,
            save_tape: None,
            record_usage_updates: false,
            upstream_timeout_secs: None,
            proxy_url: None,
            pricing: PricingConfig::default(),
            inspect: None,
            observer_capacity: default_observer_capacity(),
            config_path: None,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // 配置文件不存在，返回默认配置
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// 获取配置文件路径（如果有）
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// 将当前配置写回原始配置文件
    pub fn save(&self) -> anyhow::Result<()> {
        let path = self
            .config_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("配置文件路径未知，无法保存配置"))?;

        let content = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .with_context(|| format!("写入配置文件失败: {}", path.display()))?;
        Ok(())
    }

    /// 校验配置
    ///
    /// 代理列表不能为空、listen/target 不能为空、listen 不能重复，缓存 TTL 必须可解析
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proxies.is_empty() {
            anyhow::bail!("至少需要配置一个代理实例");
        }

        let mut seen = HashSet::new();
        for (i, proxy) in self.proxies.iter().enumerate() {
            if proxy.listen.trim().is_empty() {
                anyhow::bail!("代理 #{} 缺少 listen 地址", i + 1);
            }
            if proxy.target.trim().is_empty() {
                anyhow::bail!("代理 #{} ({}) 缺少 target 地址", i + 1, proxy.listen);
            }
            let url = reqwest::Url::parse(&proxy.target)
                .with_context(|| format!("代理 {} 的 target 不是合法 URL: {}", proxy.listen, proxy.target))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("代理 {} 的 target 仅支持 http/https: {}", proxy.listen, proxy.target);
            }
            if !seen.insert(proxy.listen.as_str()) {
                anyhow::bail!("listen 地址重复: {}", proxy.listen);
            }
        }

        if self.cache.mode != CacheMode::None {
            self.cache.ttl_duration()?;
        }

        if let Some(inspect) = &self.inspect {
            if inspect.api_key.is_empty() {
                anyhow::bail!("inspect.apiKey 不能为空");
            }
        }

        Ok(())
    }
}

/// TTL 上限：100 年
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// 解析 TTL 字符串（数字 + s/m/h/d）
pub fn parse_ttl(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("TTL 不能为空");
    }

    let unit_start = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
    let (number, unit) = s.split_at(unit_start);
    let multiplier: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => anyhow::bail!("无效的 TTL 单位: {}（可选 s/m/h/d）", s),
    };
    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("无效的 TTL 数值: {}", s))?;
    if value == 0 {
        anyhow::bail!("TTL 必须大于 0: {}", s);
    }

    let secs = value
        .checked_mul(multiplier)
        .filter(|secs| *secs <= MAX_TTL_SECS)
        .with_context(|| format!("TTL 过大: {}（最长 36500d）", s))?;
    Ok(Duration::from_secs(secs))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
