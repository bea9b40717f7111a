//! Dispatch cost estimation.
//!
//! When the external pricing lookup is enabled and answers in time, the
//! estimate uses per-million prompt/completion prices for the configured
//! model, cached per model for the process lifetime. Otherwise a
//! route-class heuristic applies. Either way the estimate is persisted as
//! `cost_estimate.json` in the task's artifact directory and recorded in
//! task metadata with its `cost_source`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use marshal_db::models::RouteClass;

use crate::config::CostConfig;
use crate::error::Result;

/// Heuristic USD per million tokens (prompt, completion) per route class.
const HEURISTIC_LIGHT: (f64, f64) = (0.05, 0.20);
const HEURISTIC_HEAVY: (f64, f64) = (0.25, 1.00);

/// Per-million prices for a model.
#[derive(Debug, Clone, Copy)]
struct ModelPricing {
    prompt_per_million: f64,
    completion_per_million: f64,
}

/// A cost estimate ready for metadata and the artifact file.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub estimated_cost_usd: f64,
    pub cost_source: String,
    pub pricing_model: String,
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

/// Pricing lookup with a per-model in-process cache.
pub struct PricingCache {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, ModelPricing>>,
}

impl Default for PricingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PricingCache {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Estimate the USD cost for a dispatch.
    ///
    /// Falls back to the route heuristic whenever the lookup is disabled,
    /// times out, or cannot resolve the model.
    pub async fn estimate(
        &self,
        config: &CostConfig,
        route: RouteClass,
        tokens_in: usize,
        tokens_out: usize,
    ) -> CostEstimate {
        let model = config.model_default.clone();

        if config.lookup_enabled {
            if let Some(pricing) = self.lookup(config, &model).await {
                let usd = tokens_in as f64 / 1_000_000.0 * pricing.prompt_per_million
                    + tokens_out as f64 / 1_000_000.0 * pricing.completion_per_million;
                return CostEstimate {
                    tokens_in,
                    tokens_out,
                    estimated_cost_usd: round6(usd),
                    cost_source: "openrouter_api".to_owned(),
                    pricing_model: model,
                };
            }
        }

        let (prompt_pm, completion_pm) = match route {
            RouteClass::Light => HEURISTIC_LIGHT,
            RouteClass::Heavy => HEURISTIC_HEAVY,
        };
        let usd = tokens_in as f64 / 1_000_000.0 * prompt_pm
            + tokens_out as f64 / 1_000_000.0 * completion_pm;
        CostEstimate {
            tokens_in,
            tokens_out,
            estimated_cost_usd: round6(usd),
            cost_source: "heuristic".to_owned(),
            pricing_model: model,
        }
    }

    async fn lookup(&self, config: &CostConfig, model: &str) -> Option<ModelPricing> {
        {
            let cache = self.cache.lock().await;
            if let Some(pricing) = cache.get(model) {
                return Some(*pricing);
            }
        }

        let url = format!("{}/models", config.api_base.trim_end_matches('/'));
        let mut request = self
            .client
            .get(&url)
            .timeout(Duration::from_millis(config.lookup_timeout_ms.max(1)));
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }

        let body: Value = match request.send().await {
            Ok(resp) => match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(error = %e, "pricing response not json");
                    return None;
                }
            },
            Err(e) => {
                debug!(error = %e, "pricing lookup failed");
                return None;
            }
        };

        let pricing = body
            .get("data")
            .and_then(Value::as_array)?
            .iter()
            .find(|entry| entry.get("id").and_then(Value::as_str) == Some(model))
            .and_then(parse_entry)?;

        let mut cache = self.cache.lock().await;
        cache.insert(model.to_owned(), pricing);
        Some(pricing)
    }
}

/// Pricing entries carry per-token USD prices as decimal strings.
fn parse_entry(entry: &Value) -> Option<ModelPricing> {
    let pricing = entry.get("pricing")?;
    let per_token = |field: &str| -> Option<f64> {
        match pricing.get(field)? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    Some(ModelPricing {
        prompt_per_million: per_token("prompt")? * 1_000_000.0,
        completion_per_million: per_token("completion")? * 1_000_000.0,
    })
}

/// Persist the estimate as `cost_estimate.json` next to the other task
/// artifacts.
pub fn write_cost_artifact(
    artifact_dir: &Path,
    task_id: &str,
    estimate: &CostEstimate,
) -> Result<()> {
    std::fs::create_dir_all(artifact_dir)?;
    let payload = serde_json::json!({
        "task_id": task_id,
        "tokens_in": estimate.tokens_in,
        "tokens_out": estimate.tokens_out,
        "estimated_cost_usd": estimate.estimated_cost_usd,
        "cost_source": estimate.cost_source,
        "pricing_model": estimate.pricing_model,
        "generated_at": marshal_db::models::utc_now(),
    });
    std::fs::write(
        artifact_dir.join("cost_estimate.json"),
        serde_json::to_string_pretty(&payload).expect("static json shape"),
    )?;
    Ok(())
}
