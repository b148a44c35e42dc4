use crate::chat::{ChatCompletionRequest, ResponseUnit};
use crate::config::{Capability, ProviderConfig};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub mod echo;
pub mod openai_compat;

/// Lazy output of one chat-completion call.
pub type ResponseStream = BoxStream<'static, Result<ResponseUnit, ProviderError>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Failed(String),
    /// The upstream connection was drained before the gateway could read it.
    /// This is the only failure the orchestrator retries on another provider.
    #[error("stream already consumed: {0}")]
    StreamAlreadyConsumed(String),
}

impl ProviderError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StreamAlreadyConsumed(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub models: BTreeSet<String>,
    pub costs: HashMap<String, f64>,
    pub capabilities: Vec<Capability>,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, costs: HashMap<String, f64>) -> Self {
        Self {
            id: id.into(),
            models: costs.keys().cloned().collect(),
            costs,
            capabilities: vec![Capability::ChatCompletion],
        }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Self {
        let mut descriptor = Self::new(cfg.id.clone(), cfg.models.clone());
        descriptor.capabilities = cfg.capabilities.clone();
        descriptor
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Cost multiplier for `model`, 1 when unspecified.
    pub fn cost_multiplier(&self, model: &str) -> f64 {
        self.costs
            .get(model)
            .copied()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(1.0)
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Yields one terminal unit when `request.stream` is false, otherwise
    /// incremental chunks ending with a finish-reason-bearing chunk.
    async fn run_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ResponseStream, ProviderError>;

    fn id(&self) -> &str {
        &self.descriptor().id
    }
}

pub struct ProviderFactory {
    pub kind: &'static str,
    pub build: fn(&ProviderConfig, &reqwest::Client) -> Result<Arc<dyn Provider>, String>,
}

inventory::collect!(ProviderFactory);

pub fn factory_kinds() -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = inventory::iter::<ProviderFactory>
        .into_iter()
        .map(|f| f.kind)
        .collect();
    kinds.sort_unstable();
    kinds
}

pub fn build_providers(
    configs: &[ProviderConfig],
    http: &reqwest::Client,
) -> Result<Vec<Arc<dyn Provider>>, String> {
    let mut providers = Vec::with_capacity(configs.len());
    for cfg in configs {
        let factory = inventory::iter::<ProviderFactory>
            .into_iter()
            .find(|f| f.kind == cfg.kind)
            .ok_or_else(|| {
                format!(
                    "unknown provider kind '{}' for '{}' (known: {})",
                    cfg.kind,
                    cfg.id,
                    factory_kinds().join(", ")
                )
            })?;
        let provider = (factory.build)(cfg, http)?;
        tracing::info!(
            provider = %cfg.id,
            kind = %cfg.kind,
            models = cfg.models.len(),
            "provider registered"
        );
        providers.push(provider);
    }
    Ok(providers)
}
