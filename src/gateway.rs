use crate::accounts::key_prefix;
use crate::chat::{
    ChatCompletion, ChatCompletionRequest, CompletionCollector, ResponseUnit, Usage,
    generate_chatcmpl_id, now_ts,
};
use crate::config::Capability;
use crate::error::GatewayError;
use crate::meter;
use crate::providers::{Provider, ProviderError};
use crate::quota::QuotaGate;
use crate::registry::ProviderRegistry;
use crate::search::{self, WebSearch};
use crate::stream::{self, Finalization, Settle, SseStream, StreamIdentity, StreamOutcome};
use crate::telemetry::{TelemetryQueue, UsageRecord};
use async_trait::async_trait;
use futures_util::{StreamExt, stream as futures_stream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

pub enum ChatReply {
    Completion(ChatCompletion),
    Stream(SseStream),
}

/// Provider and upstream model chosen for one request.
struct Route {
    provider: Arc<dyn Provider>,
    model: String,
    pinned: bool,
}

/// Request routing, fallback and metering around the provider call.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    quota: QuotaGate,
    search: Arc<dyn WebSearch>,
    search_max_results: usize,
    telemetry: TelemetryQueue,
    restricted_models: Arc<HashMap<String, Vec<String>>>,
    api_version: String,
}

impl Gateway {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        quota: QuotaGate,
        search: Arc<dyn WebSearch>,
        search_max_results: usize,
        telemetry: TelemetryQueue,
        restricted_models: HashMap<String, Vec<String>>,
        api_version: String,
    ) -> Self {
        Self {
            registry,
            quota,
            search,
            search_max_results,
            telemetry,
            restricted_models: Arc::new(restricted_models),
            api_version,
        }
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub async fn chat_completions(
        &self,
        api_key: &str,
        mut request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<ChatReply, GatewayError> {
        let started = Instant::now();

        let (model, wants_search) = search::strip_web_suffix(&request.model);
        let model = model.to_string();
        let route = self.resolve(&model)?;
        if wants_search {
            let found =
                search::augment(self.search.as_ref(), &mut request.messages, self.search_max_results)
                    .await;
            tracing::debug!(request_id, results = found, "web search appended");
        }
        request.model = route.model.clone();

        let now = now_ts();
        let account = self.quota.authenticate(api_key).await?;
        let account = self.quota.enforce_plan_expiry(account, now).await?;
        if let Some(allowed) = self.restricted_models.get(&route.model)
            && !allowed.iter().any(|plan| plan == &account.plan)
        {
            return Err(GatewayError::Forbidden(route.model));
        }
        let account = self.quota.reconcile_daily_reset(account, now).await?;
        let plan = self.quota.plan_for(&account);
        self.quota.check_limits(&account, &plan)?;

        tracing::info!(
            request_id,
            account = %account.key_prefix(),
            provider = %route.provider.id(),
            model = %route.model,
            pinned = route.pinned,
            stream = request.is_stream(),
            "dispatching chat completion"
        );

        let input_chars = request.input_chars();
        if request.is_stream() {
            return Ok(ChatReply::Stream(
                self.dispatch_stream(api_key, route, request, input_chars, started)
                    .await,
            ));
        }

        let (provider, completion) = self.dispatch_batch(&route, request, request_id).await?;
        let settlement = self.settlement(api_key, &provider, &route.model, input_chars, started, false);
        let output_chars = completion.output_chars();
        settlement.bill(output_chars).await?;

        let mut completion = completion;
        completion.normalize(&generate_chatcmpl_id(), now_ts(), &route.model);
        if completion.usage.is_none() {
            let (prompt, generated) = meter::usage_tokens(input_chars, output_chars);
            completion.usage = Some(Usage::new(prompt, generated));
        }
        Ok(ChatReply::Completion(completion))
    }

    fn resolve(&self, model: &str) -> Result<Route, GatewayError> {
        if let Some((provider_id, pinned_model)) = model.split_once('@')
            && let Some(provider) = self.registry.find_forwarded_provider(provider_id)
        {
            let descriptor = provider.descriptor();
            if !descriptor.serves(pinned_model) || !descriptor.supports(Capability::ChatCompletion) {
                return Err(GatewayError::ModelNotSupported {
                    provider: provider_id.to_string(),
                    model: pinned_model.to_string(),
                });
            }
            return Ok(Route {
                provider,
                model: pinned_model.to_string(),
                pinned: true,
            });
        }
        let provider = self
            .registry
            .find_by_model(model)
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))?;
        Ok(Route {
            provider,
            model: model.to_string(),
            pinned: false,
        })
    }

    async fn dispatch_stream(
        &self,
        api_key: &str,
        route: Route,
        request: ChatCompletionRequest,
        input_chars: usize,
        started: Instant,
    ) -> SseStream {
        let settlement =
            self.settlement(api_key, &route.provider, &route.model, input_chars, started, true);
        let units = match route.provider.run_chat_completion(request).await {
            Ok(units) => units,
            Err(err) => futures_stream::once(async move { Err(err) }).boxed(),
        };
        let identity = StreamIdentity::new(
            generate_chatcmpl_id(),
            now_ts(),
            route.model,
            self.api_version.clone(),
        );
        stream::normalize(units, identity, Finalization::new(Arc::new(settlement)))
    }

    /// Drains providers until one yields a completion. Only a drained
    /// upstream connection moves on to an untried provider, and never for a
    /// pinned route.
    async fn dispatch_batch(
        &self,
        route: &Route,
        request: ChatCompletionRequest,
        request_id: &str,
    ) -> Result<(Arc<dyn Provider>, ChatCompletion), GatewayError> {
        let mut provider = route.provider.clone();
        let mut tried: HashSet<String> = HashSet::new();
        loop {
            tried.insert(provider.id().to_string());
            let err = match collect(provider.as_ref(), request.clone()).await {
                Ok(completion) => return Ok((provider, completion)),
                Err(err) => err,
            };
            if !err.is_recoverable() || route.pinned {
                return Err(GatewayError::Provider(err.to_string()));
            }
            let Some(next) = self.registry.find_alternate(&route.model, &tried) else {
                tracing::warn!(request_id, model = %route.model, error = %err, "no untried provider left");
                return Err(GatewayError::Provider(err.to_string()));
            };
            tracing::warn!(
                request_id,
                from = %provider.id(),
                to = %next.id(),
                model = %route.model,
                error = %err,
                "falling back to alternate provider"
            );
            metrics::counter!("ozone_fallbacks_total").increment(1);
            provider = next;
        }
    }

    fn settlement(
        &self,
        api_key: &str,
        provider: &Arc<dyn Provider>,
        model: &str,
        input_chars: usize,
        started: Instant,
        streaming: bool,
    ) -> Settlement {
        Settlement {
            quota: self.quota.clone(),
            telemetry: self.telemetry.clone(),
            api_key: api_key.to_string(),
            provider: provider.id().to_string(),
            model: model.to_string(),
            multiplier: provider.descriptor().cost_multiplier(model),
            input_chars,
            started,
            streaming,
        }
    }
}

async fn collect(
    provider: &dyn Provider,
    request: ChatCompletionRequest,
) -> Result<ChatCompletion, ProviderError> {
    let mut units = provider.run_chat_completion(request).await?;
    let mut collector = CompletionCollector::new();
    while let Some(unit) = units.next().await {
        match unit? {
            ResponseUnit::Chunk(chunk) => collector.push_chunk(chunk),
            ResponseUnit::Completion(completion) => collector.push_completion(completion),
            ResponseUnit::Error(message) => return Err(ProviderError::Failed(message)),
        }
    }
    collector
        .finish()
        .ok_or_else(|| ProviderError::Failed("No response received from provider".to_string()))
}

/// Debit followed by telemetry; shared by the batch and streaming paths so
/// both bill from the same inputs.
struct Settlement {
    quota: QuotaGate,
    telemetry: TelemetryQueue,
    api_key: String,
    provider: String,
    model: String,
    multiplier: f64,
    input_chars: usize,
    started: Instant,
    streaming: bool,
}

impl Settlement {
    async fn bill(&self, output_chars: usize) -> Result<i64, GatewayError> {
        let billed = meter::billable(meter::cost(self.input_chars, output_chars, self.multiplier));
        let debit = self.quota.debit(&self.api_key, billed).await;
        match &debit {
            Ok(balance) => tracing::debug!(
                account = %key_prefix(&self.api_key),
                billed,
                balance,
                "account debited"
            ),
            Err(err) => tracing::error!(
                account = %key_prefix(&self.api_key),
                billed,
                error = %err,
                "debit failed"
            ),
        }
        self.telemetry.submit(UsageRecord {
            account: key_prefix(&self.api_key).to_string(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            input_chars: self.input_chars,
            output_chars,
            billed_tokens: billed,
            elapsed: self.started.elapsed(),
            streaming: self.streaming,
        });
        debit.map(|_| billed)
    }
}

#[async_trait]
impl Settle for Settlement {
    async fn settle(&self, output_chars: usize, outcome: StreamOutcome) {
        tracing::debug!(model = %self.model, outcome = outcome.as_str(), output_chars, "settling stream");
        let _ = self.bill(output_chars).await;
    }
}
