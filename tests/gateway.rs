// End-to-end tests against the assembled router with an in-process mock
// upstream standing in for the Anthropic Messages API.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use polygate::api::build_router;
use polygate::auth::synthesize::synthesize_credentials;
use polygate::auth::AuthStore;
use polygate::config::AppConfig;
use polygate::manager::Manager;
use polygate::registry::ModelRegistry;

#[derive(Clone, Default)]
struct MockUpstream {
    requests: Arc<Mutex<Vec<Value>>>,
    responses: Arc<Mutex<Vec<(u16, Value, Vec<(String, String)>)>>>,
}

impl MockUpstream {
    fn push_response(&self, status: u16, body: Value) {
        self.responses.lock().push((status, body, Vec::new()));
    }

    fn push_response_with_headers(&self, status: u16, body: Value, headers: Vec<(String, String)>) {
        self.responses.lock().push((status, body, headers));
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn last_request(&self) -> Option<Value> {
        self.requests.lock().last().cloned()
    }
}

async fn mock_messages(
    State(mock): State<MockUpstream>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    mock.requests.lock().push(body);
    let (status, response, headers) = {
        let mut responses = mock.responses.lock();
        if responses.is_empty() {
            (
                200,
                json!({
                    "id": "msg_default",
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "text", "text": "ok"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 1, "output_tokens": 1}
                }),
                Vec::new(),
            )
        } else {
            responses.remove(0)
        }
    };
    let mut builder = axum::http::Response::builder()
        .status(status)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(response.to_string()))
        .unwrap()
        .into_response()
}

async fn spawn_mock() -> (MockUpstream, String) {
    let mock = MockUpstream::default();
    let app = Router::new()
        .route("/v1/messages", post(mock_messages))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{addr}"))
}

/// Builds a gateway whose credential set comes from the given config.
async fn spawn_gateway(config: AppConfig) -> String {
    let config = Arc::new(config);
    let store = Arc::new(AuthStore::new());
    let registry = Arc::new(ModelRegistry::new());
    let auth_dir = tempfile::tempdir().unwrap();
    let credentials = synthesize_credentials(&config, auth_dir.path());
    store.apply(&store.diff(&credentials));
    registry.rebuild(store.snapshot().values());
    let manager = Arc::new(Manager::new(store, registry, config));
    let app = build_router(manager);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn claude_alias_config(base_url: &str, api_key: &str) -> AppConfig {
    serde_yaml::from_str(&format!(
        r#"
claude-api-key:
  - api-key: {api_key}
    base-url: {base_url}
    models:
      - name: claude-opus-4-5
        alias: gpt-x
"#
    ))
    .unwrap()
}

#[tokio::test]
async fn openai_chat_served_by_anthropic_credential() {
    let (mock, upstream_url) = spawn_mock().await;
    mock.push_response(
        200,
        json!({
            "id": "msg_e2e",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "short answer"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        }),
    );
    let gateway = spawn_gateway(claude_alias_config(&upstream_url, "sk-a")).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-x",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    // Downstream response is OpenAI chat shaped with mapped finish reason.
    assert_eq!(body["choices"][0]["message"]["content"], "short answer");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 16);

    // Upstream call was Anthropic shaped: alias resolved, system lifted.
    let upstream = mock.last_request().unwrap();
    assert_eq!(upstream["model"], "claude-opus-4-5");
    assert_eq!(upstream["system"][0], json!({"type": "text", "text": "be terse"}));
    assert_eq!(
        upstream["messages"],
        json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
    );
    assert!(upstream.get("max_tokens").is_some());
}

#[tokio::test]
async fn quota_failover_cools_first_credential() {
    let (mock_a, url_a) = spawn_mock().await;
    let (mock_b, url_b) = spawn_mock().await;
    mock_a.push_response_with_headers(
        429,
        json!({"type": "error", "error": {"type": "rate_limit_error", "message": "slow down"}}),
        vec![("retry-after".into(), "5".into())],
    );
    mock_b.push_response(
        200,
        json!({
            "id": "msg_b",
            "type": "message",
            "content": [{"type": "text", "text": "from b"}],
            "stop_reason": "end_turn"
        }),
    );
    // Two eligible credentials; ids sort deterministically and round-robin
    // starts at the first, so mock A is hit first.
    let config: AppConfig = serde_yaml::from_str(&format!(
        r#"
request-retry: 3
claude-api-key:
  - api-key: sk-a
    base-url: {url_a}
    models: [{{name: claude-opus-4-5, alias: gpt-x}}]
  - api-key: sk-b
    base-url: {url_b}
    models: [{{name: claude-opus-4-5, alias: gpt-x}}]
"#
    ))
    .unwrap();
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();
    let request = json!({
        "model": "gpt-x",
        "messages": [{"role": "user", "content": "hi"}]
    });

    // Issue two dispatches. Whichever order round-robin picks, the 429
    // credential cools after its first failure and is skipped afterwards.
    let first: Value = client
        .post(format!("{gateway}/v1/messages"))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["content"][0]["text"], "from b");

    mock_b.push_response(
        200,
        json!({
            "id": "msg_b2",
            "type": "message",
            "content": [{"type": "text", "text": "from b again"}],
            "stop_reason": "end_turn"
        }),
    );
    let second = client
        .post(format!("{gateway}/v1/messages"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);

    // The cooled credential saw exactly one request.
    assert_eq!(mock_a.request_count(), 1);
    assert_eq!(mock_b.request_count(), 2);
}

#[tokio::test]
async fn unknown_model_is_not_found_and_empty_messages_are_rejected() {
    let (_mock, upstream_url) = spawn_mock().await;
    let gateway = spawn_gateway(claude_alias_config(&upstream_url, "sk-a")).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({"model": "never-heard-of-it", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({"model": "gpt-x", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn upstream_error_bodies_pass_through_verbatim() {
    let (mock, upstream_url) = spawn_mock().await;
    mock.push_response(
        400,
        json!({"type": "error", "error": {"type": "invalid_request_error", "message": "native shape"}}),
    );
    let gateway = spawn_gateway(claude_alias_config(&upstream_url, "sk-a")).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{gateway}/v1/messages"))
        .json(&json!({"model": "gpt-x", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    // The Anthropic error body reaches the client untranslated.
    assert_eq!(body["error"]["message"], "native shape");
}

#[tokio::test]
async fn client_auth_rejects_bad_keys_in_constant_time_path() {
    let (_mock, upstream_url) = spawn_mock().await;
    let mut config = claude_alias_config(&upstream_url, "sk-a");
    config.api_keys = vec!["gateway-secret".into()];
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();
    let request = json!({"model": "gpt-x", "messages": [{"role": "user", "content": "x"}]});

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .bearer_auth("gateway-secret")
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn streaming_translates_anthropic_sse_to_openai_chunks() {
    // A raw SSE upstream: axum handler returning a hand-built event stream.
    let sse_body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_s\"}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let app = Router::new().route(
        "/v1/messages",
        post(move || async move {
            axum::http::Response::builder()
                .status(200)
                .header("content-type", "text/event-stream")
                .body(axum::body::Body::from(sse_body))
                .unwrap()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let gateway = spawn_gateway(claude_alias_config(&upstream_url, "sk-a")).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-x",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();

    // Concatenated deltas equal the terminal text, and the stream is
    // properly terminated for the OpenAI dialect.
    let mut content = String::new();
    let mut finish = None;
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            finish.get_or_insert("done-without-finish");
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if let Some(delta) = chunk["choices"][0]["delta"]["content"].as_str() {
            content.push_str(delta);
        }
        if let Some(reason) = chunk["choices"][0]["finish_reason"].as_str() {
            finish = Some(match reason {
                "stop" => "stop",
                _ => "other",
            });
        }
    }
    assert_eq!(content, "Hello");
    assert_eq!(finish, Some("stop"));
    assert!(text.contains("data: [DONE]"));
}
