use async_trait::async_trait;
use axum::Json;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::response::Sse;
use axum::response::sse::Event;
use axum::routing::post;
use futures_util::{StreamExt, stream};
use http_body_util::BodyExt;
use ozone::accounts::{AccountStore, NewAccount};
use ozone::app::{AppState, Collaborators, RuntimeConfig};
use ozone::chat::{
    ChatCompletionChunk, ChatCompletionRequest, Delta, FunctionCall, ResponseUnit, now_ts,
};
use ozone::config::{GatewayConfig, PlanConfig, ProviderConfig};
use ozone::providers::{Provider, ProviderDescriptor, ProviderError, ResponseStream};
use ozone::search::{SearchResult, WebSearch};
use ozone::telemetry::{TelemetrySink, UsageRecord};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Clone)]
enum Script {
    Reply(String),
    Consumed,
    Fail(String),
    InBand(String),
    BreakMidStream(String),
    HangAfter(String),
    FunctionCall { name: String, arguments: String },
}

struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    script: Script,
    calls: AtomicUsize,
    seen: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedProvider {
    fn new(id: &str, models: &[(&str, f64)], script: Script) -> Arc<Self> {
        let costs: HashMap<String, f64> =
            models.iter().map(|(m, c)| (m.to_string(), *c)).collect();
        Arc::new(Self {
            descriptor: ProviderDescriptor::new(id, costs),
            script,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> ChatCompletionRequest {
        self.seen.lock().unwrap().last().cloned().expect("no request seen")
    }
}

fn text_chunk(model: &str, text: &str) -> Result<ResponseUnit, ProviderError> {
    Ok(ResponseUnit::Chunk(ChatCompletionChunk::delta(
        "upstream-id",
        1,
        model,
        Delta {
            content: Some(text.to_string()),
            ..Delta::default()
        },
    )))
}

/// Batch callers get one completion carrying the whole call; streaming
/// callers get the name first and the arguments in fragments.
fn function_call_units(request: &ChatCompletionRequest, name: &str, arguments: &str) -> ResponseStream {
    if !request.is_stream() {
        let completion = serde_json::from_value(json!({
            "id": "upstream-id",
            "created": 1,
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "function_call": { "name": name, "arguments": arguments }
                },
                "finish_reason": "function_call"
            }]
        }))
        .unwrap();
        return stream::iter(vec![Ok(ResponseUnit::Completion(completion))]).boxed();
    }
    let fragment = |call: FunctionCall| -> Result<ResponseUnit, ProviderError> {
        Ok(ResponseUnit::Chunk(ChatCompletionChunk::delta(
            "upstream-id",
            1,
            &request.model,
            Delta {
                function_call: Some(call),
                ..Delta::default()
            },
        )))
    };
    let mut units = vec![fragment(FunctionCall {
        name: Some(name.to_string()),
        arguments: Some(String::new()),
    })];
    let chars: Vec<char> = arguments.chars().collect();
    for piece in chars.chunks(98) {
        units.push(fragment(FunctionCall {
            name: None,
            arguments: Some(piece.iter().collect()),
        }));
    }
    units.push(Ok(ResponseUnit::Chunk(ChatCompletionChunk::finish(
        "upstream-id",
        1,
        &request.model,
        "function_call",
    ))));
    stream::iter(units).boxed()
}

fn reply_units(request: &ChatCompletionRequest, text: &str) -> ResponseStream {
    if !request.is_stream() {
        let completion = serde_json::from_value(json!({
            "id": "upstream-id",
            "created": 1,
            "model": request.model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": text },
                "finish_reason": "stop"
            }]
        }))
        .unwrap();
        return stream::iter(vec![Ok(ResponseUnit::Completion(completion))]).boxed();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut units: Vec<Result<ResponseUnit, ProviderError>> = chars
        .chunks(100)
        .map(|piece| text_chunk(&request.model, &piece.iter().collect::<String>()))
        .collect();
    units.push(Ok(ResponseUnit::Chunk(ChatCompletionChunk::finish(
        "upstream-id",
        1,
        &request.model,
        "stop",
    ))));
    stream::iter(units).boxed()
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn run_chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        match &self.script {
            Script::Reply(text) => Ok(reply_units(&request, text)),
            Script::FunctionCall { name, arguments } => {
                Ok(function_call_units(&request, name, arguments))
            }
            Script::Consumed => Err(ProviderError::StreamAlreadyConsumed(
                "connection drained".to_string(),
            )),
            Script::Fail(message) => Err(ProviderError::Failed(message.clone())),
            Script::InBand(message) => {
                Ok(stream::iter(vec![Ok(ResponseUnit::Error(message.clone()))]).boxed())
            }
            Script::BreakMidStream(text) => Ok(stream::iter(vec![
                text_chunk(&request.model, text),
                Err(ProviderError::Failed("upstream reset".to_string())),
            ])
            .boxed()),
            Script::HangAfter(text) => Ok(stream::iter(vec![text_chunk(&request.model, text)])
                .chain(stream::pending())
                .boxed()),
        }
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<UsageRecord>>);

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn record(&self, record: &UsageRecord) -> Result<(), String> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

impl RecordingSink {
    fn records(&self) -> Vec<UsageRecord> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct StaticSearch {
    queries: Mutex<Vec<String>>,
}

#[async_trait]
impl WebSearch for StaticSearch {
    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<SearchResult>, String> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(vec![SearchResult {
            title: "Rust".to_string(),
            url: "https://www.rust-lang.org".to_string(),
            body: "A language empowering everyone.".to_string(),
        }])
    }
}

struct TestContext {
    router: axum::Router,
    state: AppState,
    telemetry: Arc<RecordingSink>,
    search: Arc<StaticSearch>,
    _temp_dir: TempDir,
}

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.plans.insert(
        "default".to_string(),
        PlanConfig {
            tokens_per_day: 1_000,
            rpm: 500,
            rph: 5_000,
            rpd: 5_000,
        },
    );
    config.plans.insert(
        "pro".to_string(),
        PlanConfig {
            tokens_per_day: 100_000,
            rpm: 100_000,
            rph: 100_000,
            rpd: 100_000,
        },
    );
    config
        .restricted_models
        .insert("premium".to_string(), vec!["pro".to_string()]);
    config
}

async fn setup_with(config: GatewayConfig, providers: Vec<Arc<dyn Provider>>) -> TestContext {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("ozone.db");
    let runtime = RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        config_path: temp_dir.path().join("gateway.json"),
        telemetry_webhook: None,
        reset_sweep_seconds: 0,
    };
    let telemetry = Arc::new(RecordingSink::default());
    let search = Arc::new(StaticSearch::default());
    let state = ozone::app::load_state_with(
        runtime,
        config,
        Collaborators {
            providers,
            search: Some(search.clone()),
            telemetry: Some(telemetry.clone()),
            accounts: None,
        },
    )
    .await
    .expect("load state");
    TestContext {
        router: ozone::app::build_app(state.clone()),
        state,
        telemetry,
        search,
        _temp_dir: temp_dir,
    }
}

async fn setup(providers: Vec<Arc<dyn Provider>>) -> TestContext {
    setup_with(test_config(), providers).await
}

fn store(ctx: &TestContext) -> &Arc<dyn AccountStore> {
    ctx.state.gateway.quota().store()
}

/// Creates an account whose current period is already running, so the
/// balance is used as-is.
async fn seed_account(ctx: &TestContext, key: &str, plan: &str, balance: i64) {
    let now = now_ts();
    store(ctx)
        .create_account(
            NewAccount {
                api_key: key.to_string(),
                plan: plan.to_string(),
                quota: balance,
                plan_expiration: None,
            },
            now,
        )
        .await
        .expect("create account");
    store(ctx)
        .reset_period(key, balance, now, now + 86_400)
        .await
        .expect("start period");
}

async fn balance(ctx: &TestContext, key: &str) -> i64 {
    store(ctx)
        .get_account(key)
        .await
        .expect("get account")
        .expect("account exists")
        .balance
}

async fn wait_for_balance(ctx: &TestContext, key: &str, expected: i64) -> i64 {
    let mut current = balance(ctx, key).await;
    for _ in 0..40 {
        if current == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        current = balance(ctx, key).await;
    }
    current
}

async fn wait_for_records(ctx: &TestContext, count: usize) -> Vec<UsageRecord> {
    for _ in 0..40 {
        if ctx.telemetry.records().len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    ctx.telemetry.records()
}

fn chat_body(model: &str, user_text: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{ "role": "user", "content": user_text }]
    })
}

async fn json_post(
    router: &axum::Router,
    auth: Option<&str>,
    path: &str,
    body: Value,
) -> (StatusCode, Value) {
    let (status, bytes) = raw_post(router, auth, path, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn raw_post(
    router: &axum::Router,
    auth: Option<&str>,
    path: &str,
    body: Value,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json");
    if let Some(key) = auth {
        builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
    }
    let req = builder
        .body(Body::from(body.to_string()))
        .expect("request");
    let resp = router.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, bytes)
}

fn sse_payloads(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split("\n\n")
        .filter_map(|event| {
            event
                .lines()
                .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
                .map(|data| data.trim().to_string())
        })
        .collect()
}

#[tokio::test]
async fn non_streaming_completion_is_normalized_and_billed() {
    let provider = ScriptedProvider::new("alpha", &[("m", 2.0)], Script::Reply("o".repeat(300)));
    let ctx = setup(vec![provider.clone()]).await;
    seed_account(&ctx, "sk-bill", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-bill"),
        "/v1/chat/completions",
        chat_body("m", &"i".repeat(400), false),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "m");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);
    assert!(body["system_fingerprint"].as_str().unwrap().starts_with("fp_"));
    assert_eq!(balance(&ctx, "sk-bill").await, 10_000 - 420);

    let records = wait_for_records(&ctx, 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].billed_tokens, 420);
    assert!(!records[0].streaming);
}

#[tokio::test]
async fn streaming_is_billed_like_batch_and_ends_with_done() {
    let provider = ScriptedProvider::new("alpha", &[("m", 2.0)], Script::Reply("o".repeat(300)));
    let ctx = setup(vec![provider.clone()]).await;
    seed_account(&ctx, "sk-stream", "pro", 10_000).await;

    let (status, bytes) = raw_post(
        &ctx.router,
        Some("sk-stream"),
        "/v1/chat/completions",
        chat_body("m", &"i".repeat(400), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let payloads = sse_payloads(&bytes);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).expect("chunk json"))
        .collect();
    assert_eq!(chunks.len(), 4);
    // Upstream sends its own id and created; the gateway replaces both.
    let id = chunks[0]["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("chatcmpl-"));
    let created = chunks[0]["created"].as_i64().unwrap();
    assert_ne!(created, 1);
    for chunk in &chunks {
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["id"], id.as_str());
        assert_eq!(chunk["created"], created);
        assert_eq!(chunk["model"], "m");
    }
    assert!(chunks[0]["choices"][0]["finish_reason"].is_null());
    assert_eq!(chunks[3]["choices"][0]["finish_reason"], "stop");

    assert_eq!(wait_for_balance(&ctx, "sk-stream", 10_000 - 420).await, 10_000 - 420);
    let records = wait_for_records(&ctx, 1).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].streaming);
    assert_eq!(records[0].output_chars, 300);
}

#[tokio::test]
async fn function_call_output_is_billed_alike_in_both_modes() {
    // 6 name chars + 294 argument chars = 300 output chars.
    let provider = ScriptedProvider::new(
        "alpha",
        &[("m", 2.0)],
        Script::FunctionCall {
            name: "lookup".to_string(),
            arguments: "a".repeat(294),
        },
    );
    let ctx = setup(vec![provider.clone()]).await;
    seed_account(&ctx, "sk-fc-batch", "pro", 10_000).await;
    seed_account(&ctx, "sk-fc-stream", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-fc-batch"),
        "/v1/chat/completions",
        chat_body("m", &"i".repeat(400), false),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["choices"][0]["message"]["function_call"]["name"], "lookup");
    assert_eq!(body["choices"][0]["finish_reason"], "function_call");
    assert_eq!(balance(&ctx, "sk-fc-batch").await, 10_000 - 420);

    let (status, bytes) = raw_post(
        &ctx.router,
        Some("sk-fc-stream"),
        "/v1/chat/completions",
        chat_body("m", &"i".repeat(400), true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payloads = sse_payloads(&bytes);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["function_call"]["name"], "lookup");

    assert_eq!(
        wait_for_balance(&ctx, "sk-fc-stream", 10_000 - 420).await,
        10_000 - 420
    );
    let records = wait_for_records(&ctx, 2).await;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.output_chars == 300 && r.billed_tokens == 420));
}

#[tokio::test]
async fn drained_connection_falls_back_to_alternate_provider() {
    let drained = ScriptedProvider::new("drained", &[("m", 1.0)], Script::Consumed);
    let healthy = ScriptedProvider::new("healthy", &[("m", 1.0)], Script::Reply("ok".to_string()));
    let ctx = setup(vec![drained.clone(), healthy.clone()]).await;
    seed_account(&ctx, "sk-fb", "pro", 10_000).await;

    for _ in 0..4 {
        let (status, body) = json_post(
            &ctx.router,
            Some("sk-fb"),
            "/v1/chat/completions",
            chat_body("m", "hello", false),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
    }
    assert_eq!(healthy.calls(), 4);
    assert!(drained.calls() <= 4);
}

#[tokio::test]
async fn drained_connection_without_alternate_is_500() {
    let drained = ScriptedProvider::new("drained", &[("m", 1.0)], Script::Consumed);
    let ctx = setup(vec![drained.clone()]).await;
    seed_account(&ctx, "sk-solo", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-solo"),
        "/v1/chat/completions",
        chat_body("m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["status"], "Failed");
    assert!(body["error"]["message"].as_str().unwrap().contains("connection drained"));
    assert_eq!(drained.calls(), 1);
    assert_eq!(balance(&ctx, "sk-solo").await, 10_000);
}

#[tokio::test]
async fn other_provider_failures_are_not_retried() {
    let failing = ScriptedProvider::new("failing", &[("m", 1.0)], Script::Fail("bad gateway".to_string()));
    let healthy = ScriptedProvider::new("healthy", &[("m", 1.0)], Script::Reply("ok".to_string()));
    let ctx = setup(vec![failing.clone(), healthy.clone()]).await;
    seed_account(&ctx, "sk-nr", "pro", 10_000).await;

    let mut failures = 0;
    for _ in 0..6 {
        let (status, body) = json_post(
            &ctx.router,
            Some("sk-nr"),
            "/v1/chat/completions",
            chat_body("m", "hello", false),
        )
        .await;
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            assert_eq!(body["error"]["message"], "bad gateway");
            failures += 1;
        }
    }
    assert_eq!(failures, failing.calls());
    assert_eq!(healthy.calls(), 6 - failures);
}

#[tokio::test]
async fn in_band_error_unit_is_surfaced_without_retry() {
    let broken = ScriptedProvider::new("broken", &[("m", 1.0)], Script::InBand("model overloaded".to_string()));
    let ctx = setup(vec![broken.clone()]).await;
    seed_account(&ctx, "sk-ib", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-ib"),
        "/v1/chat/completions",
        chat_body("m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["message"], "model overloaded");
    assert_eq!(broken.calls(), 1);
}

#[tokio::test]
async fn pinned_request_only_uses_named_provider() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("from a".to_string()));
    let b = ScriptedProvider::new("b", &[("m", 1.0), ("other", 1.0)], Script::Reply("from b".to_string()));
    let ctx = setup(vec![a.clone(), b.clone()]).await;
    seed_account(&ctx, "sk-pin", "pro", 10_000).await;

    for _ in 0..4 {
        let (status, body) = json_post(
            &ctx.router,
            Some("sk-pin"),
            "/v1/chat/completions",
            chat_body("b@m", "hello", false),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["choices"][0]["message"]["content"], "from b");
        assert_eq!(body["model"], "m");
    }
    assert_eq!(a.calls(), 0);
    assert_eq!(b.calls(), 4);
    assert_eq!(b.last_request().model, "m");

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-pin"),
        "/v1/chat/completions",
        chat_body("a@other", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["message"], "Provider a does not support model other");
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn pinned_request_never_falls_back() {
    let drained = ScriptedProvider::new("drained", &[("m", 1.0)], Script::Consumed);
    let healthy = ScriptedProvider::new("healthy", &[("m", 1.0)], Script::Reply("ok".to_string()));
    let ctx = setup(vec![drained.clone(), healthy.clone()]).await;
    seed_account(&ctx, "sk-pinfb", "pro", 10_000).await;

    let (status, _) = json_post(
        &ctx.router,
        Some("sk-pinfb"),
        "/v1/chat/completions",
        chat_body("drained@m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(healthy.calls(), 0);
}

#[tokio::test]
async fn unknown_model_is_404_before_authentication() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a.clone()]).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-does-not-exist"),
        "/v1/chat/completions",
        chat_body("no-such-model", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["message"], "Model not found");
    assert_eq!(body["error"]["hint"], "Ensure the model name is correct.");
    assert_eq!(body["error"]["url"], "/v1/chat/completions");
    assert_eq!(body["error"]["api_version"], "v1");
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn rpm_ceiling_rejects_before_dispatch() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-rpm", "default", 1_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-rpm"),
        "/v1/chat/completions",
        chat_body("m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["status"], "Out of Quota");
    assert_eq!(body["error"]["message"], "RPM Limit Exceeded.");
    assert_eq!(a.calls(), 0);
    assert_eq!(balance(&ctx, "sk-rpm").await, 1_000);
    assert!(ctx.telemetry.records().is_empty());
}

#[tokio::test]
async fn overdrawn_account_is_rejected() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-neg", "pro", 10).await;
    store(&ctx).increment_balance("sk-neg", -20).await.unwrap();

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-neg"),
        "/v1/chat/completions",
        chat_body("m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["message"], "Not enough quota available for this request.");
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn missing_or_unknown_credentials_are_401() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a.clone()]).await;

    let (status, body) = json_post(
        &ctx.router,
        None,
        "/v1/chat/completions",
        chat_body("m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["status"], "Failed");

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-unknown"),
        "/v1/chat/completions",
        chat_body("m", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["message"], "Invalid API key");
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn restricted_model_requires_allowed_plan() {
    let a = ScriptedProvider::new("a", &[("premium", 1.0)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-basic", "default", 100).await;
    seed_account(&ctx, "sk-pro", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-basic"),
        "/v1/chat/completions",
        chat_body("premium", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["error"]["message"],
        "Model premium is not available for your current plan."
    );

    let (status, _) = json_post(
        &ctx.router,
        Some("sk-pro"),
        "/v1/chat/completions",
        chat_body("premium", "hello", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(a.calls(), 1);
}

#[tokio::test]
async fn web_suffix_appends_one_search_message() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-web", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-web"),
        "/v1/chat/completions",
        json!({
            "model": "m:web",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "what is rust" }
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["model"], "m");

    let seen = a.last_request();
    assert_eq!(seen.model, "m");
    assert_eq!(seen.messages.len(), 3);
    let appended = &seen.messages[2];
    assert_eq!(appended.role, "system");
    assert!(appended.text().starts_with("Web search results: "));
    assert!(appended.text().contains("rust-lang.org"));
    assert_eq!(
        ctx.search.queries.lock().unwrap().as_slice(),
        ["be brief what is rust".to_string()]
    );
}

#[tokio::test]
async fn streaming_upstream_error_emits_error_then_done_and_bills_once() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::BreakMidStream("abc".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-se", "pro", 10_000).await;

    let (status, bytes) = raw_post(
        &ctx.router,
        Some("sk-se"),
        "/v1/chat/completions",
        chat_body("m", "hello world!", true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payloads = sse_payloads(&bytes);
    assert_eq!(payloads.len(), 3);
    let error: Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(error["error"]["message"], "upstream reset");
    assert_eq!(payloads[2], "[DONE]");

    // 12 input chars and 3 output chars: (3 + 1) * 1.05 rounds to 4.
    assert_eq!(wait_for_balance(&ctx, "sk-se", 10_000 - 4).await, 10_000 - 4);
    let records = wait_for_records(&ctx, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.telemetry.records().len(), 1);
    assert_eq!(records[0].output_chars, 3);
}

#[tokio::test]
async fn streaming_client_disconnect_settles_once() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::HangAfter("abcdef".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-dc", "pro", 10_000).await;

    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, "Bearer sk-dc")
        .body(Body::from(chat_body("m", "hello world!", true).to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body();
    let first = body.frame().await.expect("first frame").expect("frame ok");
    assert!(first.is_data());
    drop(body);

    // 12 input chars and 6 output chars: (3 + 2) * 1.05 rounds to 5.
    assert_eq!(wait_for_balance(&ctx, "sk-dc", 10_000 - 5).await, 10_000 - 5);
    wait_for_records(&ctx, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = ctx.telemetry.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].output_chars, 6);
}

#[tokio::test]
async fn concurrent_requests_debit_without_lost_updates() {
    let a = ScriptedProvider::new("a", &[("m", 1.0)], Script::Reply("abc".to_string()));
    let ctx = setup(vec![a.clone()]).await;
    seed_account(&ctx, "sk-conc", "pro", 10_000).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let router = ctx.router.clone();
        handles.push(tokio::spawn(async move {
            json_post(
                &router,
                Some("sk-conc"),
                "/v1/chat/completions",
                chat_body("m", "abcd", false),
            )
            .await
            .0
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }
    // (4/4 + 3/3) * 1.05 rounds to 2 per request.
    assert_eq!(balance(&ctx, "sk-conc").await, 10_000 - 40);
}

#[tokio::test]
async fn models_endpoint_lists_catalog() {
    let a = ScriptedProvider::new("a", &[("m", 2.0), ("n", 1.0)], Script::Reply("x".to_string()));
    let b = ScriptedProvider::new("b", &[("m", 1.5)], Script::Reply("x".to_string()));
    let ctx = setup(vec![a, b]).await;

    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["id"], "m");
    assert_eq!(data[0]["owned_by"], json!(["a", "b"]));
    assert_eq!(data[0]["cost"], 1.5);
    assert_eq!(data[1]["owned_by"], "a");
}

async fn start_upstream() -> SocketAddr {
    async fn chat(Json(body): Json<Value>) -> axum::response::Response {
        let model = body["model"].as_str().unwrap_or("mock").to_string();
        let reply = format!("echo:{}", body["messages"].as_array().map(|m| m.len()).unwrap_or(0));
        if body["stream"].as_bool() == Some(true) {
            let events: Vec<Result<Event, Infallible>> = vec![
                Ok(Event::default().data(
                    json!({
                        "id": "up-1",
                        "object": "chat.completion.chunk",
                        "created": 1,
                        "model": model,
                        "choices": [{ "index": 0, "delta": { "role": "assistant", "content": reply }, "finish_reason": null }]
                    })
                    .to_string(),
                )),
                Ok(Event::default().data(
                    json!({
                        "id": "up-1",
                        "object": "chat.completion.chunk",
                        "created": 1,
                        "model": model,
                        "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }]
                    })
                    .to_string(),
                )),
                Ok(Event::default().data("[DONE]")),
            ];
            return Sse::new(stream::iter(events)).into_response();
        }
        Json(json!({
            "id": "up-1",
            "object": "chat.completion",
            "created": 1,
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": reply },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 }
        }))
        .into_response()
    }

    let app = axum::Router::new().route("/v1/chat/completions", post(chat));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn openai_compatible_upstream_round_trip() {
    let addr = start_upstream().await;
    let mut config = test_config();
    let mut models = HashMap::new();
    models.insert("gpt-test".to_string(), 1.0);
    config.providers.push(ProviderConfig {
        id: "upstream".to_string(),
        kind: "openai_compat".to_string(),
        base_url: Some(format!("http://{addr}")),
        api_key: Some("sk-upstream".to_string()),
        models,
        capabilities: vec![ozone::config::Capability::ChatCompletion],
        timeout_ms: 5_000,
    });
    let ctx = setup_with(config, Vec::new()).await;
    seed_account(&ctx, "sk-up", "pro", 10_000).await;

    let (status, body) = json_post(
        &ctx.router,
        Some("sk-up"),
        "/v1/chat/completions",
        chat_body("upstream@gpt-test", "hi", false),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["choices"][0]["message"]["content"], "echo:1");
    assert_eq!(body["usage"]["total_tokens"], 2);

    let (status, bytes) = raw_post(
        &ctx.router,
        Some("sk-up"),
        "/v1/chat/completions",
        chat_body("gpt-test", "hi", true),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let payloads = sse_payloads(&bytes);
    assert_eq!(payloads.len(), 3);
    let first: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "echo:1");
    assert_eq!(first["model"], "gpt-test");
    assert_eq!(payloads[2], "[DONE]");
}
