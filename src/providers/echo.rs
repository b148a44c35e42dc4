use super::{Provider, ProviderDescriptor, ProviderError, ProviderFactory, ResponseStream};
use crate::chat::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatMessage, Choice, Delta,
    ResponseUnit, generate_chatcmpl_id, now_ts,
};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use std::sync::Arc;

/// Local provider that answers with the last user message. Useful for smoke
/// testing a deployment without upstream credentials.
pub struct EchoProvider {
    descriptor: ProviderDescriptor,
}

impl EchoProvider {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self { descriptor }
    }
}

fn build(cfg: &ProviderConfig, _http: &reqwest::Client) -> Result<Arc<dyn Provider>, String> {
    Ok(Arc::new(EchoProvider::new(ProviderDescriptor::from_config(cfg))))
}

inventory::submit! {
    ProviderFactory { kind: "echo", build }
}

fn last_user_text(request: &ChatCompletionRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(ChatMessage::text)
        .unwrap_or_default()
}

#[async_trait]
impl Provider for EchoProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn run_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let reply = last_user_text(&request);
        let id = generate_chatcmpl_id();
        let created = now_ts();

        if !request.is_stream() {
            let completion = ChatCompletion {
                id,
                object: String::new(),
                created,
                model: request.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::new("assistant", reply),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: None,
                system_fingerprint: None,
            };
            return Ok(stream::iter([Ok(ResponseUnit::Completion(completion))]).boxed());
        }

        let mut units = Vec::new();
        for (idx, word) in reply.split_inclusive(' ').enumerate() {
            let delta = Delta {
                role: (idx == 0).then(|| "assistant".to_string()),
                content: Some(word.to_string()),
                ..Delta::default()
            };
            units.push(Ok(ResponseUnit::Chunk(ChatCompletionChunk::delta(
                &id,
                created,
                &request.model,
                delta,
            ))));
        }
        units.push(Ok(ResponseUnit::Chunk(ChatCompletionChunk::finish(
            &id,
            created,
            &request.model,
            "stop",
        ))));
        Ok(stream::iter(units).boxed())
    }
}
