// Executor layer: one implementation per provider wire protocol. Executors
// receive payloads already in their provider's dialect and return raw
// provider responses; translation happens above them.

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Auth;
use crate::error::{GatewayError, Result};
use crate::translator::{Dialect, StreamEvent};

pub mod claude;
pub mod cross_provider;
pub mod gemini;
pub mod gemini_cli;
pub mod openai;

pub use claude::ClaudeExecutor;
pub use cross_provider::CrossProviderExecutor;
pub use gemini::GeminiExecutor;
pub use gemini_cli::GeminiCliExecutor;
pub use openai::OpenAiExecutor;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Watchdog between stream chunks; a healthy model keeps the stream warmer
/// than this even while thinking.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound for one SSE line. Vision payloads get big.
const MAX_SSE_LINE: usize = 20 * 1024 * 1024;

/// Per-dispatch execution context.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Options resolved by the selector before the executor runs.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Upstream model name (aliases already resolved).
    pub model: String,
    /// The provider-side dialect the payload is in.
    pub dialect: Dialect,
}

pub type EventReceiver = mpsc::Receiver<Result<StreamEvent>>;

#[async_trait]
pub trait Executor: Send + Sync {
    fn identifier(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<Value>;

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<EventReceiver>;

    /// Best-effort token count for the payload. Providers without a
    /// counting endpoint estimate from payload size.
    async fn count_tokens(
        &self,
        _ctx: &ExecContext,
        _auth: &Auth,
        payload: &Value,
        _opts: &ExecOptions,
    ) -> Result<u64> {
        Ok(estimate_tokens(payload))
    }

    /// Refreshes near-expiry OAuth tokens; identity for API keys.
    async fn refresh(&self, _ctx: &ExecContext, _auth: &Auth) -> Result<()> {
        Ok(())
    }
}

/// Rough tokenizer-free estimate used where no counting endpoint exists.
pub fn estimate_tokens(payload: &Value) -> u64 {
    (payload.to_string().len() as u64 / 4).max(1)
}

static CLAUDE: Lazy<Arc<ClaudeExecutor>> = Lazy::new(|| Arc::new(ClaudeExecutor::new()));
static OPENAI: Lazy<Arc<OpenAiExecutor>> = Lazy::new(|| Arc::new(OpenAiExecutor::new()));
static GEMINI: Lazy<Arc<GeminiExecutor>> = Lazy::new(|| Arc::new(GeminiExecutor::new()));
static GEMINI_CLI: Lazy<Arc<GeminiCliExecutor>> = Lazy::new(|| Arc::new(GeminiCliExecutor::new()));
static CROSS_CLAUDE: Lazy<Arc<CrossProviderExecutor>> =
    Lazy::new(|| Arc::new(CrossProviderExecutor::new()));

/// Executor selection by credential provider tag. Unknown tags are treated
/// as OpenAI-compatible endpoints, which is what config-declared
/// compatibility providers are.
pub fn executor_for(provider: &str) -> Arc<dyn Executor> {
    match provider {
        "claude" => CLAUDE.clone(),
        "gemini" => GEMINI.clone(),
        "gemini-cli" => GEMINI_CLI.clone(),
        "cross-provider-claude" => CROSS_CLAUDE.clone(),
        _ => OPENAI.clone(),
    }
}

/// Dialects a provider speaks natively, preferred first.
pub fn provider_dialects(provider: &str) -> &'static [Dialect] {
    match provider {
        "claude" | "cross-provider-claude" => &[Dialect::AnthropicMessages],
        "gemini" | "gemini-cli" => &[Dialect::GeminiV1Beta],
        _ => &[Dialect::OpenAiChat, Dialect::OpenAiResponses],
    }
}

static CLIENT_POOL: Lazy<Mutex<HashMap<String, reqwest::Client>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-default outbound proxy, from config. Credentials with their own
/// `proxy_url` override it.
static DEFAULT_PROXY: Lazy<RwLock<String>> = Lazy::new(|| RwLock::new(String::new()));

pub fn set_default_proxy(url: &str) {
    *DEFAULT_PROXY.write() = url.trim().to_string();
}

/// HTTP clients are pooled per proxy URL; the empty key is the direct
/// (environment-proxied) client.
pub fn http_client(proxy_url: Option<&str>) -> Result<reqwest::Client> {
    let key = proxy_url
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .unwrap_or_else(|| DEFAULT_PROXY.read().clone());
    if let Some(client) = CLIENT_POOL.lock().get(&key) {
        return Ok(client.clone());
    }
    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if !key.is_empty() {
        let proxy = reqwest::Proxy::all(&key)
            .map_err(|e| GatewayError::Network(format!("invalid proxy url {key}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    let client = builder
        .build()
        .map_err(|e| GatewayError::Network(format!("failed to build http client: {e}")))?;
    CLIENT_POOL.lock().insert(key, client.clone());
    Ok(client)
}

/// Applies `header:*` attributes declared on the credential.
pub fn apply_custom_headers(mut builder: reqwest::RequestBuilder, auth: &Auth) -> reqwest::RequestBuilder {
    for (name, value) in auth.custom_headers() {
        builder = builder.header(name, value);
    }
    builder
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Turns a non-2xx response into an UpstreamStatus error carrying the body
/// verbatim. No translation is performed on error bodies.
pub async fn error_from_response(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
    GatewayError::upstream(status, body, &content_type, retry_after)
}

/// Reads an SSE (or newline-delimited JSON) body into a bounded channel of
/// parsed events. The channel preserves upstream order; cancellation closes
/// the connection before the channel; an idle watchdog bounds the gap
/// between chunks. Malformed data lines pass through as raw strings.
pub fn spawn_event_reader(response: reqwest::Response, cancel: CancellationToken) -> EventReceiver {
    let (tx, rx) = mpsc::channel::<Result<StreamEvent>>(1);
    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut current_event: Option<String> = None;

        'read: loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break 'read,
                next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    let _ = tx
                        .send(Err(GatewayError::Network("stream idle timeout".into())))
                        .await;
                    break 'read;
                }
                Ok(None) => break 'read,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(GatewayError::from(e))).await;
                    break 'read;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            buffer.extend_from_slice(&chunk);
            if buffer.len() > MAX_SSE_LINE {
                let _ = tx
                    .send(Err(GatewayError::Translation("sse line exceeds buffer limit".into())))
                    .await;
                break 'read;
            }

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    // Event boundary; the event name resets with each event.
                    current_event = None;
                    continue;
                }
                if let Some(name) = line.strip_prefix("event:") {
                    current_event = Some(name.trim().to_string());
                    continue;
                }
                let data = if let Some(data) = line.strip_prefix("data:") {
                    data.trim_start()
                } else if line.starts_with(':') {
                    // SSE comment / keep-alive.
                    continue;
                } else if line.starts_with('{') {
                    // Newline-delimited JSON without SSE framing.
                    line
                } else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let value = serde_json::from_str::<Value>(data)
                    .unwrap_or_else(|_| Value::String(data.to_string()));
                let event = StreamEvent {
                    event: current_event.clone(),
                    data: value,
                };
                if tx.send(Ok(event)).await.is_err() {
                    break 'read;
                }
            }
        }
        // Dropping the response body closes the upstream connection; the
        // channel closes when tx drops here.
    });
    rx
}

/// Emits at most one usage report per request, either from a usage payload
/// seen in the response or as a synthetic end-of-stream flush.
pub struct UsageReporter {
    identifier: &'static str,
    model: String,
    auth_id: String,
    emitted: bool,
}

impl UsageReporter {
    pub fn new(identifier: &'static str, model: &str, auth: &Auth) -> Self {
        Self {
            identifier,
            model: model.to_string(),
            auth_id: auth.id.clone(),
            emitted: false,
        }
    }

    pub fn publish(&mut self, usage: &Value) {
        if self.emitted || usage.is_null() {
            return;
        }
        self.emitted = true;
        tracing::info!(
            target: "polygate::usage",
            executor = self.identifier,
            model = %self.model,
            auth = %self.auth_id,
            usage = %usage,
            "usage report"
        );
    }

    pub fn ensure_published(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        tracing::info!(
            target: "polygate::usage",
            executor = self.identifier,
            model = %self.model,
            auth = %self.auth_id,
            "usage report (no usage payload observed)"
        );
    }
}

/// Best-effort write-back of a rotated OAuth token to the credential's
/// backing file, so restarts pick it up. The file is re-read and only the
/// token fields touched: virtual credentials share a file with their
/// parent, and the in-memory metadata of a virtual child is not the full
/// file. The watcher's normalized equality keeps this from generating a
/// Modify event.
pub(crate) fn persist_token(
    auth: &Auth,
    access_token: &str,
    refresh_token: &str,
    expiry: Option<chrono::DateTime<chrono::Utc>>,
) {
    let path = match auth.attr("path") {
        Some(path) => path.to_string(),
        None => return,
    };
    let mut metadata: Value = match std::fs::read(&path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
    {
        Some(metadata) => metadata,
        None => {
            tracing::warn!(path, "cannot re-read auth file to persist refreshed token");
            return;
        }
    };
    let target = if metadata.get("token").map(|t| t.is_object()).unwrap_or(false) {
        &mut metadata["token"]
    } else {
        &mut metadata
    };
    if let Some(obj) = target.as_object_mut() {
        obj.insert("access_token".into(), serde_json::json!(access_token));
        obj.insert("refresh_token".into(), serde_json::json!(refresh_token));
        if let Some(expiry) = expiry {
            obj.insert("expiry".into(), serde_json::json!(expiry.to_rfc3339()));
        }
    }
    if let Ok(content) = serde_json::to_string_pretty(&metadata) {
        if let Err(e) = std::fs::write(&path, content) {
            tracing::warn!(path, error = %e, "failed to persist refreshed token");
        }
    }
}

/// Wraps a stream so the reporter sees every usage payload and a synthetic
/// report is flushed at end of stream if no usage chunk arrived.
pub fn attach_usage_reporter(mut rx: EventReceiver, mut reporter: UsageReporter) -> EventReceiver {
    let (tx, out) = mpsc::channel(1);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(parsed) = &event {
                if let Some(usage) = usage_of(&parsed.data) {
                    reporter.publish(&usage);
                } else if let Some(usage) = parsed.data.get("message").and_then(|m| m.get("usage")) {
                    reporter.publish(usage);
                }
            }
            if tx.send(event).await.is_err() {
                return;
            }
        }
        reporter.ensure_published();
    });
    out
}

/// Extracts a usage object from a provider payload, wherever the provider
/// puts it.
pub fn usage_of(payload: &Value) -> Option<Value> {
    payload
        .get("usage")
        .or_else(|| payload.get("usageMetadata"))
        .or_else(|| payload.get("response").and_then(|r| r.get("usageMetadata")))
        .cloned()
        .filter(|u| !u.is_null())
}
