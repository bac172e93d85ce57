//! 按模型汇总 Tape 中的 token 与费用

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use super::loader::Tape;
use crate::capture::record::{RequestRecord, RequestStatus};

const UNKNOWN_MODEL: &str = "(unknown)";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCostSummary {
    pub model: String,
    pub request_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    /// 按费用降序
    pub models: Vec<ModelCostSummary>,
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn from_tape(tape: &Tape) -> Self {
        Self::from_records(&tape.requests)
    }

    /// 汇总已结束的请求，进行中的请求不计入
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a RequestRecord>,
    {
        let mut by_model: HashMap<&str, ModelCostSummary> = HashMap::new();
        for record in records {
            if record.status == RequestStatus::Pending {
                continue;
            }
            let model = if record.model.is_empty() {
                UNKNOWN_MODEL
            } else {
                record.model.as_str()
            };
            let summary = by_model.entry(model).or_insert_with(|| ModelCostSummary {
                model: model.to_string(),
                ..Default::default()
            });
            summary.request_count += 1;
            summary.input_tokens += record.input_tokens;
            summary.output_tokens += record.output_tokens;
            summary.cost += record.cost;
        }

        let mut models: Vec<ModelCostSummary> = by_model.into_values().collect();
        models.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.model.cmp(&b.model)));

        let mut breakdown = Self {
            models,
            ..Default::default()
        };
        for m in &breakdown.models {
            breakdown.total_requests += m.request_count;
            breakdown.total_input_tokens += m.input_tokens;
            breakdown.total_output_tokens += m.output_tokens;
            breakdown.total_cost += m.cost;
        }
        breakdown
    }

    /// 文本表格
    pub fn render(&self) -> String {
        let width = self
            .models
            .iter()
            .map(|m| m.model.chars().count())
            .max()
            .unwrap_or(0)
            .max("TOTAL".len())
            .max("MODEL".len());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>14}  {:>14}  {:>12}",
            "MODEL", "REQUESTS", "INPUT", "OUTPUT", "COST"
        );
        for m in &self.models {
            let _ = writeln!(
                out,
                "{:<width$}  {:>8}  {:>14}  {:>14}  {:>12}",
                m.model,
                m.request_count,
                format_with_commas(m.input_tokens),
                format_with_commas(m.output_tokens),
                format!("${:.4}", m.cost)
            );
        }
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>14}  {:>14}  {:>12}",
            "TOTAL",
            self.total_requests,
            format_with_commas(self.total_input_tokens),
            format_with_commas(self.total_output_tokens),
            format!("${:.4}", self.total_cost)
        );
        out
    }
}

/// 千分位格式化
pub fn format_with_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
