use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One finalized request, as reported to the usage log.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub account: String,
    pub model: String,
    pub provider: String,
    pub input_chars: usize,
    pub output_chars: usize,
    pub billed_tokens: i64,
    pub elapsed: Duration,
    pub streaming: bool,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<(), String>;
}

pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn record(&self, record: &UsageRecord) -> Result<(), String> {
        tracing::info!(
            account = %record.account,
            model = %record.model,
            provider = %record.provider,
            input = record.input_chars,
            output = record.output_chars,
            billed = record.billed_tokens,
            elapsed_ms = record.elapsed.as_millis() as u64,
            streaming = record.streaming,
            "chat completion usage"
        );
        Ok(())
    }
}

/// Posts a chat-embed payload to an incoming-webhook URL.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

pub fn webhook_payload(record: &UsageRecord) -> serde_json::Value {
    let mode = if record.streaming {
        "Streaming"
    } else {
        "Non-Streaming"
    };
    let field = |name: &str, value: String| json!({ "name": name, "value": value, "inline": true });
    json!({
        "embeds": [{
            "title": format!("Chat Completion Log ({mode})"),
            "color": 3447003,
            "fields": [
                field("User", format!("`{}`", record.account)),
                field("Model", record.model.clone()),
                field("Execution Time", format!("{:.2}s", record.elapsed.as_secs_f64())),
                field("Input Tokens", record.input_chars.to_string()),
                field("Output Tokens", record.output_chars.to_string()),
                field("Total Tokens", (record.input_chars + record.output_chars).to_string()),
            ],
            "timestamp": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        }]
    })
}

#[async_trait]
impl TelemetrySink for WebhookSink {
    async fn record(&self, record: &UsageRecord) -> Result<(), String> {
        let resp = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&webhook_payload(record))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("webhook status {}", resp.status()));
        }
        Ok(())
    }
}

/// Bounded hand-off to a background delivery task. Submitting never waits:
/// when the queue is full the record is dropped and counted.
#[derive(Clone)]
pub struct TelemetryQueue {
    tx: mpsc::Sender<UsageRecord>,
}

impl TelemetryQueue {
    pub fn spawn(sink: Arc<dyn TelemetrySink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<UsageRecord>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = sink.record(&record).await {
                    tracing::warn!(error = %err, model = %record.model, "telemetry delivery failed");
                }
            }
        });
        Self { tx }
    }

    pub fn submit(&self, record: UsageRecord) {
        if let Err(err) = self.tx.try_send(record) {
            metrics::counter!("ozone_telemetry_dropped_total").increment(1);
            tracing::warn!(error = %err, "telemetry record dropped");
        }
    }
}
