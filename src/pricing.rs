//! 模型价格目录
//!
//! 价格单位为美元 / 百万 token。目录来自 models.dev，后台拉取，
//! 拉取失败或尚未加载时所有查询返回 `None`，费用记为 0。

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// 单个模型的价格
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub reasoning: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

/// 价格查询接口
pub trait PricingLookup: Send + Sync {
    /// 根据上游 URL 识别服务商 ID
    fn provider_for_url(&self, url: &str) -> Option<String>;

    /// 查询模型价格，`provider_id` 可为空
    fn model_cost(&self, provider_id: Option<&str>, model: &str) -> Option<ModelCost>;
}

/// 不提供任何价格
#[derive(Debug, Default)]
pub struct NoPricing;

impl PricingLookup for NoPricing {
    fn provider_for_url(&self, _url: &str) -> Option<String> {
        None
    }

    fn model_cost(&self, _provider_id: Option<&str>, _model: &str) -> Option<ModelCost> {
        None
    }
}

/// 按 token 数计算费用
pub fn calculate_cost(cost: Option<&ModelCost>, input_tokens: u64, output_tokens: u64) -> f64 {
    let Some(cost) = cost else {
        return 0.0;
    };
    (input_tokens as f64 / 1_000_000.0) * cost.input
        + (output_tokens as f64 / 1_000_000.0) * cost.output
}

/// 按请求体长度粗略估算输入 token（约 4 字节一个 token）
pub fn estimate_input_tokens(body_len: usize) -> u64 {
    (body_len / 4) as u64
}

/// 常见服务商的主机名特征
const PROVIDER_HOST_PATTERNS: &[(&str, &[&str])] = &[
    ("openai", &["api.openai.com"]),
    ("anthropic", &["api.anthropic.com"]),
    ("google", &["generativelanguage.googleapis.com"]),
    ("openrouter", &["openrouter.ai"]),
    ("groq", &["api.groq.com"]),
    ("together", &["api.together.xyz", "together.ai"]),
    ("fireworks", &["fireworks.ai"]),
    ("mistral", &["api.mistral.ai"]),
    ("cohere", &["api.cohere.ai", "cohere.ai"]),
    ("deepseek", &["api.deepseek.com"]),
    ("xai", &["api.x.ai"]),
];

#[derive(Debug, Default, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    cost: Option<ModelCost>,
}

#[derive(Debug, Default, Deserialize)]
struct Provider {
    #[serde(default)]
    api: Option<String>,
    #[serde(default)]
    models: BTreeMap<String, ModelInfo>,
}

#[derive(Debug, Default)]
struct Catalog {
    providers: BTreeMap<String, Provider>,
    /// 模型 slug -> 价格（跨服务商的兜底表）
    global: BTreeMap<String, ModelCost>,
}

impl Catalog {
    fn parse(json: &[u8]) -> Result<Self, serde_json::Error> {
        let providers: BTreeMap<String, Provider> = serde_json::from_slice(json)?;

        // 先出现的服务商优先，除非它的输入价格为 0 而后者非 0
        let mut global: BTreeMap<String, ModelCost> = BTreeMap::new();
        for provider in providers.values() {
            for (slug, model) in &provider.models {
                let cost = model.cost.unwrap_or_default();
                match global.get(slug) {
                    Some(existing) if !(existing.input == 0.0 && cost.input > 0.0) => {}
                    _ => {
                        global.insert(slug.clone(), cost);
                    }
                }
            }
        }

        Ok(Self { providers, global })
    }
}

/// models.dev 价格目录
#[derive(Default)]
pub struct ModelsDb {
    catalog: RwLock<Option<Catalog>>,
}

impl ModelsDb {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.catalog.read().is_some()
    }

    /// 加载目录 JSON，返回服务商数量
    pub fn load_json(&self, json: &[u8]) -> Result<usize, serde_json::Error> {
        let catalog = Catalog::parse(json)?;
        let count = catalog.providers.len();
        *self.catalog.write() = Some(catalog);
        Ok(count)
    }

    /// 从远端拉取目录
    pub async fn fetch(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<usize> {
        let response = client.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        Ok(self.load_json(&body)?)
    }
}

/// 模型名变体：原样、`.`/`-` 互换、小写
fn slug_variations(model: &str) -> [String; 3] {
    [
        model.replace('.', "-"),
        model.replace('-', "."),
        model.to_lowercase(),
    ]
}

fn strip_vendor_prefix(model: &str) -> Option<&str> {
    model.split_once('/').map(|(_, rest)| rest)
}

fn lookup_in<'a, V>(map: &'a BTreeMap<String, V>, model: &str) -> Option<&'a V> {
    if let Some(v) = map.get(model) {
        return Some(v);
    }
    if let Some(v) = strip_vendor_prefix(model).and_then(|short| map.get(short)) {
        return Some(v);
    }
    slug_variations(model).iter().find_map(|variant| map.get(variant))
}

impl PricingLookup for ModelsDb {
    fn provider_for_url(&self, url: &str) -> Option<String> {
        let guard = self.catalog.read();
        let catalog = guard.as_ref()?;
        let url = url.trim_end_matches('/');

        for (id, provider) in &catalog.providers {
            if let Some(api) = provider.api.as_deref().filter(|a| !a.is_empty()) {
                if url.starts_with(api.trim_end_matches('/')) {
                    return Some(id.clone());
                }
            }
        }

        let lower = url.to_lowercase();
        PROVIDER_HOST_PATTERNS
            .iter()
            .filter(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
            .map(|(id, _)| *id)
            .find(|id| catalog.providers.contains_key(*id))
            .map(str::to_string)
    }

    fn model_cost(&self, provider_id: Option<&str>, model: &str) -> Option<ModelCost> {
        let guard = self.catalog.read();
        let catalog = guard.as_ref()?;

        if let Some(provider) = provider_id.and_then(|id| catalog.providers.get(id)) {
            if let Some(info) = lookup_in(&provider.models, model) {
                return Some(info.cost.unwrap_or_default());
            }
        }

        if let Some(cost) = lookup_in(&catalog.global, model) {
            return Some(*cost);
        }

        // 两个方向的 "." 后缀匹配，例如 Bedrock 的 "us.anthropic.claude-..." 与 "anthropic.claude-..."
        let suffix = format!(".{}", model);
        catalog
            .global
            .iter()
            .find(|(slug, _)| slug.ends_with(&suffix) || model.ends_with(&format!(".{}", slug)))
            .map(|(_, cost)| *cost)
    }
}
