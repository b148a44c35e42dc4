use crate::config::Capability;
use crate::providers::Provider;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Read-only set of providers, built once at startup and shared by reference.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: serde_json::Value,
    pub cost: f64,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn list_providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Any chat-capable provider serving `model`; ties are broken at random.
    pub fn find_by_model(&self, model: &str) -> Option<Arc<dyn Provider>> {
        self.find_alternate(model, &HashSet::new())
    }

    pub fn find_forwarded_provider(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.id() == provider_id)
            .cloned()
    }

    /// Like `find_by_model`, skipping providers whose ids are in `tried`.
    pub fn find_alternate(&self, model: &str, tried: &HashSet<String>) -> Option<Arc<dyn Provider>> {
        let candidates: Vec<&Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| {
                let d = p.descriptor();
                d.serves(model) && d.supports(Capability::ChatCompletion) && !tried.contains(&d.id)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = random_u64(candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    }

    /// One entry per distinct model: owners and the cheapest multiplier.
    pub fn catalog(&self) -> Vec<ModelEntry> {
        let mut by_model: BTreeMap<&str, (Vec<&str>, f64)> = BTreeMap::new();
        for provider in &self.providers {
            let d = provider.descriptor();
            for model in &d.models {
                let entry = by_model
                    .entry(model.as_str())
                    .or_insert_with(|| (Vec::new(), f64::INFINITY));
                entry.0.push(d.id.as_str());
                entry.1 = entry.1.min(d.cost_multiplier(model));
            }
        }
        by_model
            .into_iter()
            .map(|(model, (owners, cost))| ModelEntry {
                id: model.to_string(),
                object: "model",
                owned_by: if owners.len() == 1 {
                    serde_json::Value::String(owners[0].to_string())
                } else {
                    serde_json::Value::from(owners)
                },
                cost,
            })
            .collect()
    }
}

fn random_u64(bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let seed = uuid::Uuid::new_v4().as_u128() as u64;
    seed % bound
}
