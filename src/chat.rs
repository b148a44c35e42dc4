use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const COMPLETION_OBJECT: &str = "chat.completion";
pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

fn default_n() -> u32 {
    1
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Sum of message content lengths, in characters.
    pub fn input_chars(&self) -> usize {
        self.messages.iter().map(ChatMessage::content_chars).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            name: None,
            function_call: None,
            extra_body: Map::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::text)
            .unwrap_or_default()
    }

    pub fn content_chars(&self) -> usize {
        self.content
            .as_ref()
            .map(MessageContent::chars)
            .unwrap_or(0)
    }

    /// Billable output size: content plus function-call name and arguments.
    pub fn output_chars(&self) -> usize {
        self.content_chars()
            + self
                .function_call
                .as_ref()
                .map(FunctionCall::chars)
                .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn chars(&self) -> usize {
        match self {
            Self::Text(text) => text.chars().count(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .map(|text| text.chars().count())
                .sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl FunctionCall {
    pub fn chars(&self) -> usize {
        self.name.as_deref().map(|v| v.chars().count()).unwrap_or(0)
            + self
                .arguments
                .as_deref()
                .map(|v| v.chars().count())
                .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default = "completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

fn completion_object() -> String {
    COMPLETION_OBJECT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

impl ChatCompletion {
    pub fn output_chars(&self) -> usize {
        self.choices
            .first()
            .map(|choice| choice.message.output_chars())
            .unwrap_or(0)
    }

    pub fn normalize(&mut self, id: &str, created: i64, model: &str) {
        if self.id.is_empty() {
            self.id = id.to_string();
        }
        if self.created == 0 {
            self.created = created;
        }
        self.object = COMPLETION_OBJECT.to_string();
        self.model = model.to_string();
        if self.system_fingerprint.is_none() {
            self.system_fingerprint = Some(generate_system_fingerprint());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

fn chunk_object() -> String {
    CHUNK_OBJECT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

impl ChatCompletionChunk {
    pub fn delta(id: &str, created: i64, model: &str, delta: Delta) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
            system_fingerprint: None,
        }
    }

    pub fn finish(id: &str, created: i64, model: &str, finish_reason: &str) -> Self {
        let mut chunk = Self::delta(id, created, model, Delta::default());
        chunk.choices[0].finish_reason = Some(finish_reason.to_string());
        chunk
    }

    pub fn output_chars(&self) -> usize {
        let Some(choice) = self.choices.first() else {
            return 0;
        };
        choice
            .delta
            .content
            .as_deref()
            .map(|v| v.chars().count())
            .unwrap_or(0)
            + choice
                .delta
                .function_call
                .as_ref()
                .map(FunctionCall::chars)
                .unwrap_or(0)
    }

    /// Overwrites the identity fields so every chunk of one stream carries
    /// the same id, timestamp and model regardless of what upstream sent.
    pub fn restamp(&mut self, id: &str, created: i64, model: &str) {
        self.id = id.to_string();
        self.created = created;
        self.object = CHUNK_OBJECT.to_string();
        self.model = model.to_string();
    }
}

/// One item of a provider's output sequence.
#[derive(Debug, Clone)]
pub enum ResponseUnit {
    Chunk(ChatCompletionChunk),
    Completion(ChatCompletion),
    Error(String),
}

/// Folds a provider's units into a single completion for non-streaming callers.
#[derive(Debug, Default)]
pub struct CompletionCollector {
    completion: Option<ChatCompletion>,
    role: Option<String>,
    content: String,
    function_call: Option<FunctionCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    id: Option<String>,
    saw_chunk: bool,
}

impl CompletionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&mut self, completion: ChatCompletion) {
        self.completion = Some(completion);
    }

    pub fn push_chunk(&mut self, chunk: ChatCompletionChunk) {
        self.saw_chunk = true;
        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };
        if let Some(role) = choice.delta.role {
            self.role = Some(role);
        }
        if let Some(content) = choice.delta.content {
            self.content.push_str(&content);
        }
        if let Some(fragment) = choice.delta.function_call {
            let call = self.function_call.get_or_insert_with(FunctionCall::default);
            if let Some(name) = fragment.name {
                call.name.get_or_insert_with(String::new).push_str(&name);
            }
            if let Some(arguments) = fragment.arguments {
                call.arguments
                    .get_or_insert_with(String::new)
                    .push_str(&arguments);
            }
        }
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
    }

    pub fn finish(self) -> Option<ChatCompletion> {
        if let Some(completion) = self.completion {
            return Some(completion);
        }
        if !self.saw_chunk {
            return None;
        }
        let mut message = ChatMessage::new(
            self.role.unwrap_or_else(|| "assistant".to_string()),
            self.content,
        );
        message.function_call = self.function_call;
        Some(ChatCompletion {
            id: self.id.unwrap_or_default(),
            object: COMPLETION_OBJECT.to_string(),
            created: 0,
            model: String::new(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some(self.finish_reason.unwrap_or_else(|| "stop".to_string())),
            }],
            usage: self.usage,
            system_fingerprint: None,
        })
    }
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_token(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for byte in uuid::Uuid::new_v4().as_bytes() {
            if out.len() == len {
                break;
            }
            out.push(ID_ALPHABET[*byte as usize % ID_ALPHABET.len()] as char);
        }
    }
    out
}

pub fn generate_chatcmpl_id() -> String {
    format!("chatcmpl-{}", random_token(29))
}

pub fn generate_system_fingerprint() -> String {
    format!("fp_{}", random_token(9))
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
