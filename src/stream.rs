use crate::chat::{
    ChatCompletion, ChatCompletionChunk, Delta, ResponseUnit, generate_system_fingerprint,
};
use crate::error::GatewayError;
use crate::providers::ResponseStream;
use async_trait::async_trait;
use axum::response::sse::Event;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SseStream = BoxStream<'static, Result<Event, Infallible>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    UpstreamError,
    ClientDisconnected,
    /// The pump task ended without reaching a terminal state (panic).
    Aborted,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::UpstreamError => "upstream_error",
            Self::ClientDisconnected => "client_disconnected",
            Self::Aborted => "aborted",
        }
    }
}

/// Work performed once a stream ends, given the accumulated output length.
#[async_trait]
pub trait Settle: Send + Sync + 'static {
    async fn settle(&self, output_chars: usize, outcome: StreamOutcome);
}

/// Holds the settle hook until it has been run. Taking the hook out of the
/// option is what makes the finalization fire at most once; `Drop` covers
/// the paths that never reach `run`.
pub struct Finalization {
    hook: Option<Arc<dyn Settle>>,
    output_chars: usize,
}

impl Finalization {
    pub fn new(hook: Arc<dyn Settle>) -> Self {
        Self {
            hook: Some(hook),
            output_chars: 0,
        }
    }

    pub fn add_output(&mut self, chars: usize) {
        self.output_chars += chars;
    }

    pub async fn run(mut self, outcome: StreamOutcome) {
        if let Some(hook) = self.hook.take() {
            hook.settle(self.output_chars, outcome).await;
        }
    }
}

impl Drop for Finalization {
    fn drop(&mut self) {
        let Some(hook) = self.hook.take() else {
            return;
        };
        let output_chars = self.output_chars;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { hook.settle(output_chars, StreamOutcome::Aborted).await });
            }
            Err(_) => tracing::error!(output_chars, "stream finalization lost: no runtime"),
        }
    }
}

/// Identity stamped on every chunk of one response.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub system_fingerprint: String,
    pub api_version: String,
}

impl StreamIdentity {
    pub fn new(id: String, created: i64, model: String, api_version: String) -> Self {
        Self {
            id,
            created,
            model,
            system_fingerprint: generate_system_fingerprint(),
            api_version,
        }
    }

    fn stamp(&self, chunk: &mut ChatCompletionChunk) {
        chunk.restamp(&self.id, self.created, &self.model);
        if chunk.system_fingerprint.is_none() {
            chunk.system_fingerprint = Some(self.system_fingerprint.clone());
        }
    }
}

/// Re-frames provider units as canonical SSE events ending in `[DONE]`.
/// The returned stream is fed by a spawned task, which stops pulling from
/// the provider as soon as the client goes away and then finalizes.
pub fn normalize(units: ResponseStream, identity: StreamIdentity, finalization: Finalization) -> SseStream {
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(pump(units, identity, tx, finalization));
    tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(Ok)
        .boxed()
}

async fn pump(
    mut units: ResponseStream,
    identity: StreamIdentity,
    tx: mpsc::Sender<Event>,
    mut finalization: Finalization,
) {
    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => break StreamOutcome::ClientDisconnected,
            next = units.next() => next,
        };
        let mut chunk = match next {
            None => {
                let _ = tx.send(Event::default().data("[DONE]")).await;
                break StreamOutcome::Completed;
            }
            Some(Ok(ResponseUnit::Chunk(chunk))) => chunk,
            Some(Ok(ResponseUnit::Completion(completion))) => completion_as_chunk(completion),
            Some(Ok(ResponseUnit::Error(message))) => {
                send_error(&tx, &identity, message).await;
                break StreamOutcome::UpstreamError;
            }
            Some(Err(err)) => {
                send_error(&tx, &identity, err.to_string()).await;
                break StreamOutcome::UpstreamError;
            }
        };
        finalization.add_output(chunk.output_chars());
        identity.stamp(&mut chunk);
        let event = match Event::default().json_data(&chunk) {
            Ok(event) => event,
            Err(err) => {
                send_error(&tx, &identity, err.to_string()).await;
                break StreamOutcome::UpstreamError;
            }
        };
        if tx.send(event).await.is_err() {
            break StreamOutcome::ClientDisconnected;
        }
    };
    drop(units);
    tracing::debug!(
        id = %identity.id,
        model = %identity.model,
        outcome = outcome.as_str(),
        "stream finished"
    );
    finalization.run(outcome).await;
}

async fn send_error(tx: &mpsc::Sender<Event>, identity: &StreamIdentity, message: String) {
    tracing::warn!(id = %identity.id, model = %identity.model, error = %message, "stream error");
    let body = GatewayError::Provider(message)
        .into_app_error(&identity.api_version)
        .body();
    let _ = tx.send(Event::default().data(body.to_string())).await;
    let _ = tx.send(Event::default().data("[DONE]")).await;
}

/// A provider that answers a streaming call with a whole completion is
/// replayed as one chunk carrying the full message.
fn completion_as_chunk(completion: ChatCompletion) -> ChatCompletionChunk {
    let mut chunk = ChatCompletionChunk::delta(
        &completion.id,
        completion.created,
        &completion.model,
        Delta::default(),
    );
    chunk.system_fingerprint = completion.system_fingerprint;
    chunk.usage = completion.usage;
    if let Some(choice) = completion.choices.into_iter().next() {
        let message = choice.message;
        chunk.choices[0].delta = Delta {
            role: Some(message.role.clone()),
            content: Some(message.text()),
            function_call: message.function_call,
            ..Delta::default()
        };
        chunk.choices[0].finish_reason = choice.finish_reason;
    }
    chunk
}
