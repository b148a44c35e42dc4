use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_PLAN: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub plans: HashMap<String, PlanConfig>,
    #[serde(default)]
    pub restricted_models: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default = "default_telemetry_queue_capacity")]
    pub telemetry_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            plans: HashMap::new(),
            restricted_models: HashMap::new(),
            providers: Vec::new(),
            search: SearchConfig::default(),
            telemetry_queue_capacity: default_telemetry_queue_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json(raw: &str) -> Result<Self, String> {
        serde_json::from_str(raw).map_err(|err| format!("config_parse_failed: {err}"))
    }

    /// Reads the config file; a missing file falls back to the built-in default.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "gateway config not found, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(format!("config_read_failed: {err}")),
        }
    }

    pub fn plan_book(&self) -> PlanBook {
        PlanBook::new(self.plans.clone())
    }
}

/// Daily quota plus the three ceilings compared against an account's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    pub tokens_per_day: i64,
    pub rpm: i64,
    pub rph: i64,
    pub rpd: i64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            tokens_per_day: 90_000,
            rpm: 90_000,
            rph: 90_000,
            rpd: 90_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanBook {
    plans: HashMap<String, PlanConfig>,
}

impl PlanBook {
    pub fn new(mut plans: HashMap<String, PlanConfig>) -> Self {
        plans
            .entry(DEFAULT_PLAN.to_string())
            .or_insert_with(PlanConfig::default);
        Self { plans }
    }

    /// Unknown plan names resolve to the default plan.
    pub fn resolve<'a>(&'a self, name: &'a str) -> (&'a str, PlanConfig) {
        match self.plans.get(name) {
            Some(plan) => (name, *plan),
            None => (DEFAULT_PLAN, self.default_plan()),
        }
    }

    pub fn default_plan(&self) -> PlanConfig {
        self.plans
            .get(DEFAULT_PLAN)
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, f64>,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Operation kinds a provider can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ChatCompletion,
    Transcription,
    SpeechSynthesis,
    Moderation,
    ImageGeneration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    #[serde(default = "default_search_enabled")]
    pub enabled: bool,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: default_search_enabled(),
            max_results: default_search_max_results(),
            base_url: None,
        }
    }
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_telemetry_queue_capacity() -> usize {
    256
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::ChatCompletion]
}

fn default_timeout_ms() -> u64 {
    150_000
}

fn default_search_enabled() -> bool {
    true
}

fn default_search_max_results() -> usize {
    5
}
