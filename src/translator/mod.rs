// Protocol translation registry. Converters are registered once at boot,
// keyed by (client dialect, provider dialect), and are pure functions aside
// from the per-stream state threaded through streaming calls.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod gemini;
pub mod openai_claude;
pub mod responses_claude;
pub mod sanitize;

/// The four wire protocols the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenAiChat,
    OpenAiResponses,
    AnthropicMessages,
    GeminiV1Beta,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAiChat => "openai-chat",
            Dialect::OpenAiResponses => "openai-responses",
            Dialect::AnthropicMessages => "anthropic-messages",
            Dialect::GeminiV1Beta => "gemini-v1beta",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai-chat" | "openai" => Ok(Dialect::OpenAiChat),
            "openai-responses" | "responses" => Ok(Dialect::OpenAiResponses),
            "anthropic-messages" | "claude" | "anthropic" => Ok(Dialect::AnthropicMessages),
            "gemini-v1beta" | "gemini" => Ok(Dialect::GeminiV1Beta),
            other => Err(format!("unknown dialect: {other}")),
        }
    }
}

/// One upstream SSE event (or newline-delimited JSON chunk) after framing
/// has been stripped.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub event: Option<String>,
    pub data: Value,
}

/// One event destined for the client, before SSE framing is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub event: Option<String>,
    pub data: Value,
}

impl ClientEvent {
    pub fn data_only(data: Value) -> Self {
        Self { event: None, data }
    }

    pub fn named(event: &str, data: Value) -> Self {
        Self {
            event: Some(event.to_string()),
            data,
        }
    }
}

/// Kind of an open content block within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
    Thinking,
}

/// Per-stream parametric state. Created once at stream open, owned by the
/// caller, threaded through every chunk, destroyed at stream close. Tracks
/// only what the converters need; never the full response.
#[derive(Debug, Default)]
pub struct StreamState {
    /// Monotonic sequence number for dialects that carry one (Responses).
    pub sequence: u64,
    pub response_id: String,
    pub model: String,
    pub created: i64,
    pub started: bool,
    pub completed: bool,
    /// Whether the first delta chunk (carrying the assistant role) went out.
    pub role_sent: bool,
    pub block_kind: HashMap<u64, BlockKind>,
    pub block_text: HashMap<u64, String>,
    pub block_fn_name: HashMap<u64, String>,
    pub block_fn_args: HashMap<u64, String>,
    pub block_tool_id: HashMap<u64, String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Value>,
    /// Finished output items, kept so terminal Responses events can carry
    /// the accumulated content.
    pub finished_items: Vec<Value>,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }
}

type RequestFn = fn(model: &str, body: &Value, stream: bool) -> Value;
type ResponseFn = fn(model: &str, original_request: &Value, upstream: &Value) -> Value;
type StreamFn =
    fn(model: &str, original_request: &Value, event: &StreamEvent, state: &mut StreamState) -> Vec<ClientEvent>;
type FlushFn = fn(model: &str, state: &mut StreamState) -> Vec<ClientEvent>;

/// Bidirectional converter bundle for one (client, provider) pair:
/// `request` translates client → provider, `response`/`stream` translate
/// provider → client, `flush` emits synthetic terminal events at EOF.
#[derive(Clone, Copy)]
pub struct Converter {
    pub request: RequestFn,
    pub response: ResponseFn,
    pub stream: StreamFn,
    pub flush: FlushFn,
}

fn identity_request(model: &str, body: &Value, stream: bool) -> Value {
    let mut out = body.clone();
    if let Some(obj) = out.as_object_mut() {
        if obj.contains_key("model") {
            obj.insert("model".into(), Value::String(model.to_string()));
        }
        if stream && obj.contains_key("stream") {
            obj.insert("stream".into(), Value::Bool(true));
        }
    }
    out
}

fn identity_response(_model: &str, _original: &Value, upstream: &Value) -> Value {
    upstream.clone()
}

fn identity_stream(
    _model: &str,
    _original: &Value,
    event: &StreamEvent,
    state: &mut StreamState,
) -> Vec<ClientEvent> {
    // Track terminal markers so the end-of-stream flush stays silent on
    // streams the upstream already closed properly.
    let kind = event
        .event
        .as_deref()
        .or_else(|| event.data.get("type").and_then(|t| t.as_str()));
    if matches!(kind, Some("message_stop") | Some("response.completed")) {
        state.completed = true;
    }
    if event
        .data
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .map(|f| !f.is_null())
        .unwrap_or(false)
    {
        state.completed = true;
    }
    vec![ClientEvent {
        event: event.event.clone(),
        data: event.data.clone(),
    }]
}

fn no_flush(_model: &str, _state: &mut StreamState) -> Vec<ClientEvent> {
    Vec::new()
}

pub const IDENTITY: Converter = Converter {
    request: identity_request,
    response: identity_response,
    stream: identity_stream,
    flush: no_flush,
};

static REGISTRY: Lazy<HashMap<(Dialect, Dialect), Converter>> = Lazy::new(|| {
    let mut map = HashMap::new();
    // Same-dialect pairs pass payloads through but still synthesize a
    // terminal event when the upstream closes without one.
    map.insert(
        (Dialect::OpenAiChat, Dialect::OpenAiChat),
        Converter {
            flush: openai_claude::flush_chat,
            ..IDENTITY
        },
    );
    map.insert(
        (Dialect::AnthropicMessages, Dialect::AnthropicMessages),
        Converter {
            flush: openai_claude::flush_claude,
            ..IDENTITY
        },
    );
    map.insert(
        (Dialect::OpenAiResponses, Dialect::OpenAiResponses),
        Converter {
            flush: responses_claude::flush_responses,
            ..IDENTITY
        },
    );
    map.insert((Dialect::GeminiV1Beta, Dialect::GeminiV1Beta), IDENTITY);
    map.insert(
        (Dialect::OpenAiChat, Dialect::AnthropicMessages),
        Converter {
            request: openai_claude::chat_request_to_claude,
            response: openai_claude::claude_response_to_chat,
            stream: openai_claude::claude_stream_to_chat,
            flush: openai_claude::flush_chat,
        },
    );
    map.insert(
        (Dialect::AnthropicMessages, Dialect::OpenAiChat),
        Converter {
            request: openai_claude::claude_request_to_chat,
            response: openai_claude::chat_response_to_claude,
            stream: openai_claude::chat_stream_to_claude,
            flush: openai_claude::flush_claude,
        },
    );
    map.insert(
        (Dialect::OpenAiResponses, Dialect::AnthropicMessages),
        Converter {
            request: responses_claude::responses_request_to_claude,
            response: responses_claude::claude_response_to_responses,
            stream: responses_claude::claude_stream_to_responses,
            flush: responses_claude::flush_responses,
        },
    );
    map.insert(
        (Dialect::OpenAiChat, Dialect::GeminiV1Beta),
        Converter {
            request: gemini::chat_request_to_gemini,
            response: gemini::gemini_response_to_chat,
            stream: gemini::gemini_stream_to_chat,
            flush: gemini::flush_chat,
        },
    );
    map.insert(
        (Dialect::OpenAiResponses, Dialect::GeminiV1Beta),
        Converter {
            request: gemini::responses_request_to_gemini,
            response: gemini::gemini_response_to_responses,
            stream: gemini::gemini_stream_to_responses,
            flush: responses_claude::flush_responses,
        },
    );
    map
});

/// O(1) converter lookup for a (client, provider) dialect pair.
pub fn lookup(client: Dialect, provider: Dialect) -> Option<&'static Converter> {
    REGISTRY.get(&(client, provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dialect_round_trips_through_strings() {
        for dialect in [
            Dialect::OpenAiChat,
            Dialect::OpenAiResponses,
            Dialect::AnthropicMessages,
            Dialect::GeminiV1Beta,
        ] {
            assert_eq!(dialect.as_str().parse::<Dialect>().unwrap(), dialect);
        }
        assert!("smoke-signals".parse::<Dialect>().is_err());
    }

    #[test]
    fn registry_covers_declared_pairs() {
        assert!(lookup(Dialect::OpenAiChat, Dialect::AnthropicMessages).is_some());
        assert!(lookup(Dialect::AnthropicMessages, Dialect::OpenAiChat).is_some());
        assert!(lookup(Dialect::OpenAiResponses, Dialect::AnthropicMessages).is_some());
        assert!(lookup(Dialect::OpenAiChat, Dialect::GeminiV1Beta).is_some());
        assert!(lookup(Dialect::OpenAiResponses, Dialect::GeminiV1Beta).is_some());
        assert!(lookup(Dialect::OpenAiChat, Dialect::OpenAiChat).is_some());
        assert!(lookup(Dialect::GeminiV1Beta, Dialect::AnthropicMessages).is_none());
    }

    #[test]
    fn identity_request_overwrites_model() {
        let body = json!({"model": "old", "messages": [], "extra": {"kept": true}});
        let out = identity_request("new", &body, false);
        assert_eq!(out["model"], "new");
        assert_eq!(out["extra"]["kept"], true);
    }

    #[test]
    fn sequence_numbers_are_monotonic_from_zero() {
        let mut state = StreamState::new("m");
        assert_eq!(state.next_sequence(), 0);
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
    }
}
