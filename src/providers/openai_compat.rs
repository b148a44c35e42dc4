use super::{Provider, ProviderDescriptor, ProviderError, ProviderFactory, ResponseStream};
use crate::chat::{ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ResponseUnit};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{StreamExt, future, stream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Upstream speaking the OpenAI chat-completions wire format.
pub struct OpenAiCompatProvider {
    descriptor: ProviderDescriptor,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(cfg: &ProviderConfig, http: reqwest::Client) -> Result<Self, String> {
        let base_url = cfg
            .base_url
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| format!("provider '{}' is missing base_url", cfg.id))?;
        Ok(Self {
            descriptor: ProviderDescriptor::from_config(cfg),
            base_url,
            api_key: cfg.api_key.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
            http,
        })
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let mut req = self
            .http
            .post(join_url(&self.base_url, CHAT_COMPLETIONS_PATH))
            .timeout(self.timeout)
            .json(request);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| ProviderError::Failed(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = extract_error_message(&text).unwrap_or(text);
            return Err(ProviderError::Failed(format!(
                "upstream status {}: {}",
                status, detail
            )));
        }
        Ok(resp)
    }
}

fn build(cfg: &ProviderConfig, http: &reqwest::Client) -> Result<Arc<dyn Provider>, String> {
    Ok(Arc::new(OpenAiCompatProvider::new(cfg, http.clone())?))
}

inventory::submit! {
    ProviderFactory { kind: "openai_compat", build }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn run_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let resp = self.send(&request).await?;

        if !request.is_stream() {
            // A body that fails to read after the headers arrived means the
            // connection was drained underneath us.
            let text = resp
                .text()
                .await
                .map_err(|err| ProviderError::StreamAlreadyConsumed(err.to_string()))?;
            let unit = decode_completion(&text);
            return Ok(stream::once(future::ready(Ok(unit))).boxed());
        }

        let units = resp
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(event) if event.data.trim() == "[DONE]"))
            })
            .filter_map(|event| {
                future::ready(match event {
                    Ok(event) => decode_stream_event(&event.data).map(Ok),
                    Err(err) => Some(Err(ProviderError::StreamAlreadyConsumed(err.to_string()))),
                })
            })
            .boxed();
        Ok(units)
    }
}

fn decode_completion(text: &str) -> ResponseUnit {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return ResponseUnit::Error(format!("invalid upstream body: {err}")),
    };
    if let Some(message) = error_message(&value) {
        return ResponseUnit::Error(message);
    }
    match serde_json::from_value::<ChatCompletion>(value) {
        Ok(completion) => ResponseUnit::Completion(completion),
        Err(err) => ResponseUnit::Error(format!("invalid upstream completion: {err}")),
    }
}

fn decode_stream_event(data: &str) -> Option<ResponseUnit> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(err) => return Some(ResponseUnit::Error(format!("invalid upstream event: {err}"))),
    };
    if let Some(message) = error_message(&value) {
        return Some(ResponseUnit::Error(message));
    }
    Some(match serde_json::from_value::<ChatCompletionChunk>(value) {
        Ok(chunk) => ResponseUnit::Chunk(chunk),
        Err(err) => ResponseUnit::Error(format!("invalid upstream chunk: {err}")),
    })
}

fn error_message(value: &Value) -> Option<String> {
    let err = value.get("error")?;
    Some(
        err.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
    )
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1")
        && let Some(stripped) = path.strip_prefix("v1/")
    {
        path = stripped;
    }
    format!("{}/{}", base, path)
}
