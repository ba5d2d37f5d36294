use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Model tiers a run can be pointed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    /// Speed tier - fast, cheap model (gpt-oss-120b)
    Speed,
    /// Balanced tier - good reasoning at medium cost (claude-sonnet-4.5)
    #[default]
    Balanced,
    /// Smart tier - best reasoning for rewrites (claude-opus-4.5)
    Smart,
}

/// Maximum tokens for all model tiers
const MODEL_MAX_TOKENS: u32 = 16384;

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Speed => "openai/gpt-oss-120b:nitro",
            Model::Balanced => "anthropic/claude-sonnet-4.5:nitro",
            Model::Smart => "anthropic/claude-opus-4.5:nitro",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        MODEL_MAX_TOKENS
    }
}

/// API usage information from OpenRouter
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Actual cost in USD as reported by OpenRouter (`total_cost` in the usage object).
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

impl Usage {
    /// Reported cost, or 0.0 when OpenRouter did not send one. Never estimated.
    pub fn cost(&self) -> f64 {
        self.cost.unwrap_or(0.0)
    }
}

pub(crate) fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => Some(Usage {
            prompt_tokens: p.prompt_tokens + s.prompt_tokens,
            completion_tokens: p.completion_tokens + s.completion_tokens,
            total_tokens: p.total_tokens + s.total_tokens,
            cost: match (p.cost, s.cost) {
                (Some(pc), Some(sc)) => Some(pc + sc),
                (Some(pc), None) => Some(pc),
                (None, Some(sc)) => Some(sc),
                (None, None) => None,
            },
        }),
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

/// Running total of usage across every call in a run.
#[derive(Debug, Default)]
pub struct UsageMeter {
    inner: Mutex<MeterState>,
}

#[derive(Debug, Default)]
struct MeterState {
    calls: u32,
    usage: Option<Usage>,
}

impl UsageMeter {
    pub fn record(&self, usage: Option<Usage>) {
        if let Ok(mut state) = self.inner.lock() {
            state.calls += 1;
            state.usage = merge_usage(state.usage.take(), usage);
        }
    }

    /// Number of completed calls and their summed usage.
    pub fn snapshot(&self) -> (u32, Usage) {
        match self.inner.lock() {
            Ok(state) => (state.calls, state.usage.clone().unwrap_or_default()),
            Err(_) => (0, Usage::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ids() {
        assert!(Model::Speed.id().contains("gpt"));
        assert!(Model::Balanced.id().contains("claude"));
        assert!(Model::Smart.id().contains("opus"));
        assert_eq!(Model::default(), Model::Balanced);
    }

    #[test]
    fn test_model_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            model: Model,
        }
        let w: Wrapper = toml::from_str("model = \"smart\"").unwrap();
        assert_eq!(w.model, Model::Smart);
    }

    #[test]
    fn test_usage_deserialize_with_total_cost() {
        let json = r#"{"prompt_tokens": 100, "completion_tokens": 50, "total_tokens": 150, "total_cost": 0.0025}"#;
        let usage: Usage = serde_json::from_str(json).unwrap();
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.cost(), 0.0025);
    }

    #[test]
    fn test_usage_returns_zero_when_no_cost() {
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
            cost: None,
        };
        assert_eq!(usage.cost(), 0.0);
    }

    #[test]
    fn test_meter_accumulates_across_calls() {
        let meter = UsageMeter::default();
        meter.record(Some(Usage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
            cost: Some(0.01),
        }));
        meter.record(None);
        meter.record(Some(Usage {
            prompt_tokens: 50,
            completion_tokens: 5,
            total_tokens: 55,
            cost: None,
        }));
        let (calls, usage) = meter.snapshot();
        assert_eq!(calls, 3);
        assert_eq!(usage.total_tokens, 175);
        assert_eq!(usage.cost(), 0.01);
    }
}
