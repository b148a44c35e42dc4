use crate::chat::ChatMessage;
use crate::config::SearchConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const WEB_SUFFIX: &str = ":web";
const DEFAULT_DDG_URL: &str = "https://api.duckduckgo.com/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub body: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, String>;
}

/// Returns no results. Used when search is switched off in config.
pub struct NoopSearch;

#[async_trait]
impl WebSearch for NoopSearch {
    async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<SearchResult>, String> {
        Ok(Vec::new())
    }
}

/// DuckDuckGo instant-answer client.
pub struct DuckDuckGoSearch {
    http: reqwest::Client,
    base_url: String,
}

impl DuckDuckGoSearch {
    pub fn new(http: reqwest::Client, cfg: &SearchConfig) -> Self {
        Self {
            http,
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_DDG_URL.to_string()),
        }
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, String> {
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("search status {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|err| err.to_string())?;
        Ok(parse_instant_answer(&body, max_results))
    }
}

fn parse_instant_answer(body: &Value, max_results: usize) -> Vec<SearchResult> {
    let mut out = Vec::new();
    let abstract_text = body
        .get("AbstractText")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !abstract_text.is_empty() {
        out.push(SearchResult {
            title: str_field(body, "Heading"),
            url: str_field(body, "AbstractURL"),
            body: abstract_text.to_string(),
        });
    }
    if let Some(topics) = body.get("RelatedTopics").and_then(Value::as_array) {
        collect_topics(topics, &mut out);
    }
    out.truncate(max_results);
    out
}

fn collect_topics(topics: &[Value], out: &mut Vec<SearchResult>) {
    for topic in topics {
        // Grouped topics nest their entries one level down.
        if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            collect_topics(nested, out);
            continue;
        }
        let text = str_field(topic, "Text");
        if text.is_empty() {
            continue;
        }
        let title = text.split(" - ").next().unwrap_or(&text).to_string();
        out.push(SearchResult {
            title,
            url: str_field(topic, "FirstURL"),
            body: text,
        });
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Splits a trailing `:web` marker off a model name.
pub fn strip_web_suffix(model: &str) -> (&str, bool) {
    match model.strip_suffix(WEB_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (model, false),
    }
}

pub fn search_query(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(ChatMessage::text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn results_message(results: &[SearchResult]) -> ChatMessage {
    let rendered = serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string());
    ChatMessage::system(format!("Web search results: {rendered}"))
}

/// Runs the search and appends exactly one system message. Search failures
/// are logged and yield an empty result list.
pub async fn augment(
    search: &dyn WebSearch,
    messages: &mut Vec<ChatMessage>,
    max_results: usize,
) -> usize {
    let query = search_query(messages);
    let results = match search.search(&query, max_results).await {
        Ok(results) => results,
        Err(err) => {
            tracing::warn!(error = %err, "web search failed");
            Vec::new()
        }
    };
    messages.push(results_message(&results));
    results.len()
}
