// Conversions between OpenAI Chat Completions and Anthropic Messages,
// request and response, non-streaming and streaming.

use serde_json::{json, Map, Value};

use super::{BlockKind, ClientEvent, StreamEvent, StreamState};

const DEFAULT_MAX_TOKENS: u64 = 32000;

pub fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "end_turn" => "stop",
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        "stop_sequence" => "stop",
        _ => "stop",
    }
}

pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "stop" => "end_turn",
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        "content_filter" => "end_turn",
        _ => "end_turn",
    }
}

/// `data:image/png;base64,...` → Anthropic image source. Plain http(s)
/// URLs become url sources.
fn image_url_to_source(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest.split_once(";base64,")?;
        let media_type = if media_type.is_empty() {
            "application/octet-stream"
        } else {
            media_type
        };
        if data.is_empty() {
            return None;
        }
        Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data}
        }))
    } else {
        Some(json!({
            "type": "image",
            "source": {"type": "url", "url": url}
        }))
    }
}

fn source_to_image_url(source: &Value) -> Option<Value> {
    match source.get("type").and_then(|t| t.as_str()) {
        Some("base64") => {
            let media_type = source
                .get("media_type")
                .and_then(|m| m.as_str())
                .unwrap_or("application/octet-stream");
            let data = source.get("data").and_then(|d| d.as_str())?;
            Some(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{media_type};base64,{data}")}
            }))
        }
        Some("url") => {
            let url = source.get("url").and_then(|u| u.as_str())?;
            Some(json!({"type": "image_url", "image_url": {"url": url}}))
        }
        _ => None,
    }
}

/// OpenAI Chat Completions request → Anthropic Messages request. System
/// messages are lifted to the top-level `system` array; unknown fields are
/// dropped; tool arguments round-trip as parsed JSON.
pub fn chat_request_to_claude(model: &str, body: &Value, stream: bool) -> Value {
    let messages = match body.get("messages").and_then(|m| m.as_array()) {
        Some(messages) => messages,
        None => return body.clone(),
    };

    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert(
        "max_tokens".into(),
        json!(body.get("max_tokens").and_then(|v| v.as_u64()).unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    out.insert("stream".into(), json!(stream));

    let mut system_parts: Vec<Value> = Vec::new();
    let mut claude_messages: Vec<Value> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
        let content = message.get("content").unwrap_or(&Value::Null);
        match role {
            "system" | "developer" => {
                for text in collect_text(content) {
                    system_parts.push(json!({"type": "text", "text": text}));
                }
            }
            "tool" => {
                let tool_call_id = message
                    .get("tool_call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                claude_messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content_as_string(content)
                    }]
                }));
            }
            "user" | "assistant" => {
                let mut parts: Vec<Value> = Vec::new();
                match content {
                    Value::String(text) => {
                        if !text.is_empty() {
                            parts.push(json!({"type": "text", "text": text}));
                        }
                    }
                    Value::Array(items) => {
                        for item in items {
                            match item.get("type").and_then(|t| t.as_str()) {
                                Some("text") => {
                                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                                        parts.push(json!({"type": "text", "text": text}));
                                    }
                                }
                                Some("image_url") => {
                                    if let Some(url) = item
                                        .get("image_url")
                                        .and_then(|i| i.get("url"))
                                        .and_then(|u| u.as_str())
                                    {
                                        if let Some(source) = image_url_to_source(url) {
                                            parts.push(source);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
                if role == "assistant" {
                    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
                        for call in tool_calls {
                            if call.get("type").and_then(|t| t.as_str()) != Some("function") {
                                continue;
                            }
                            let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("");
                            let function = call.get("function").unwrap_or(&Value::Null);
                            let name = function.get("name").and_then(|n| n.as_str()).unwrap_or("");
                            let input = function
                                .get("arguments")
                                .and_then(|a| a.as_str())
                                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                                .unwrap_or_else(|| json!({}));
                            parts.push(json!({
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": input
                            }));
                        }
                    }
                }
                if !parts.is_empty() {
                    claude_messages.push(json!({"role": role, "content": parts}));
                }
            }
            _ => {}
        }
    }

    if !system_parts.is_empty() {
        out.insert("system".into(), Value::Array(system_parts));
    }
    out.insert("messages".into(), Value::Array(claude_messages));

    if let Some(temperature) = body.get("temperature").and_then(|v| v.as_f64()) {
        out.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = body.get("top_p").and_then(|v| v.as_f64()) {
        out.insert("top_p".into(), json!(top_p));
    }
    match body.get("stop") {
        Some(Value::String(stop)) => {
            out.insert("stop_sequences".into(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            out.insert("stop_sequences".into(), json!(stops));
        }
        _ => {}
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                let mut entry = Map::new();
                entry.insert(
                    "name".into(),
                    json!(function.get("name").and_then(|n| n.as_str()).unwrap_or("")),
                );
                if let Some(description) = function.get("description") {
                    entry.insert("description".into(), description.clone());
                }
                entry.insert(
                    "input_schema".into(),
                    function.get("parameters").cloned().unwrap_or_else(|| json!({})),
                );
                Some(Value::Object(entry))
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".into(), Value::Array(converted));
        }
    }

    match body.get("tool_choice") {
        Some(Value::String(choice)) => match choice.as_str() {
            "auto" => {
                out.insert("tool_choice".into(), json!({"type": "auto"}));
            }
            "required" => {
                out.insert("tool_choice".into(), json!({"type": "any"}));
            }
            // "none" maps to omitting the field entirely.
            _ => {}
        },
        Some(choice @ Value::Object(_)) => {
            if choice.get("type").and_then(|t| t.as_str()) == Some("function") {
                let name = choice
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("");
                out.insert("tool_choice".into(), json!({"type": "tool", "name": name}));
            }
        }
        _ => {}
    }

    Value::Object(out)
}

/// Anthropic Messages request → OpenAI Chat Completions request. Inverse of
/// `chat_request_to_claude` on the text-only subset.
pub fn claude_request_to_chat(model: &str, body: &Value, stream: bool) -> Value {
    let messages = match body.get("messages").and_then(|m| m.as_array()) {
        Some(messages) => messages,
        None => return body.clone(),
    };

    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert("stream".into(), json!(stream));

    let mut chat_messages: Vec<Value> = Vec::new();

    match body.get("system") {
        Some(Value::String(text)) if !text.is_empty() => {
            chat_messages.push(json!({"role": "system", "content": text}));
        }
        Some(Value::Array(parts)) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            if !text.is_empty() {
                chat_messages.push(json!({"role": "system", "content": text.join("\n")}));
            }
        }
        _ => {}
    }

    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        match message.get("content") {
            Some(Value::String(text)) => {
                chat_messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                let mut text_parts: Vec<Value> = Vec::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                let mut tool_results: Vec<Value> = Vec::new();
                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                text_parts.push(json!({"type": "text", "text": text}));
                            }
                        }
                        Some("image") => {
                            if let Some(source) = block.get("source") {
                                if let Some(part) = source_to_image_url(source) {
                                    text_parts.push(part);
                                }
                            }
                        }
                        Some("tool_use") => {
                            let arguments = block
                                .get("input")
                                .map(|i| i.to_string())
                                .unwrap_or_else(|| "{}".to_string());
                            tool_calls.push(json!({
                                "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                                    "arguments": arguments
                                }
                            }));
                        }
                        Some("tool_result") => {
                            tool_results.push(json!({
                                "role": "tool",
                                "tool_call_id": block.get("tool_use_id").and_then(|v| v.as_str()).unwrap_or(""),
                                "content": content_as_string(block.get("content").unwrap_or(&Value::Null))
                            }));
                        }
                        _ => {}
                    }
                }
                if !text_parts.is_empty() || !tool_calls.is_empty() {
                    let content: Value = if text_parts.len() == 1
                        && text_parts[0].get("type").and_then(|t| t.as_str()) == Some("text")
                    {
                        text_parts[0]["text"].clone()
                    } else if text_parts.is_empty() {
                        Value::Null
                    } else {
                        Value::Array(text_parts)
                    };
                    let mut message_out = Map::new();
                    message_out.insert("role".into(), json!(role));
                    message_out.insert("content".into(), content);
                    if !tool_calls.is_empty() {
                        message_out.insert("tool_calls".into(), Value::Array(tool_calls));
                    }
                    chat_messages.push(Value::Object(message_out));
                }
                chat_messages.extend(tool_results);
            }
            _ => {}
        }
    }

    out.insert("messages".into(), Value::Array(chat_messages));

    if let Some(max_tokens) = body.get("max_tokens").and_then(|v| v.as_u64()) {
        out.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = body.get("temperature").and_then(|v| v.as_f64()) {
        out.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = body.get("top_p").and_then(|v| v.as_f64()) {
        out.insert("top_p".into(), json!(top_p));
    }
    if let Some(stops) = body.get("stop_sequences").and_then(|v| v.as_array()) {
        out.insert("stop".into(), json!(stops));
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "description": tool.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                        "parameters": tool.get("input_schema").cloned().unwrap_or_else(|| json!({}))
                    }
                })
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".into(), Value::Array(converted));
        }
    }

    if let Some(choice) = body.get("tool_choice") {
        match choice.get("type").and_then(|t| t.as_str()) {
            Some("auto") => {
                out.insert("tool_choice".into(), json!("auto"));
            }
            Some("any") => {
                out.insert("tool_choice".into(), json!("required"));
            }
            Some("tool") => {
                let name = choice.get("name").and_then(|n| n.as_str()).unwrap_or("");
                out.insert(
                    "tool_choice".into(),
                    json!({"type": "function", "function": {"name": name}}),
                );
            }
            _ => {}
        }
    }

    Value::Object(out)
}

/// Anthropic Messages response → OpenAI chat completion.
pub fn claude_response_to_chat(model: &str, _original: &Value, upstream: &Value) -> Value {
    let content_blocks = upstream
        .get("content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for block in &content_blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(block_text) = block.get("text").and_then(|t| t.as_str()) {
                    text.push_str(block_text);
                }
            }
            Some("tool_use") => {
                let arguments = block
                    .get("input")
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                    "type": "function",
                    "function": {
                        "name": block.get("name").and_then(|v| v.as_str()).unwrap_or(""),
                        "arguments": arguments
                    }
                }));
            }
            _ => {}
        }
    }

    let finish_reason = upstream
        .get("stop_reason")
        .and_then(|r| r.as_str())
        .map(map_stop_reason)
        .unwrap_or("stop");

    let mut message = Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert(
        "content".into(),
        if text.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            json!(text)
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(tool_calls));
    }

    let input_tokens = upstream
        .get("usage")
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = upstream
        .get("usage")
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": format!("chatcmpl-{}", upstream.get("id").and_then(|v| v.as_str()).unwrap_or("proxy")),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens
        }
    })
}

/// OpenAI chat completion → Anthropic Messages response.
pub fn chat_response_to_claude(model: &str, _original: &Value, upstream: &Value) -> Value {
    let choice = upstream
        .get("choices")
        .and_then(|c| c.get(0))
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for call in tool_calls {
            let function = call.get("function").unwrap_or(&Value::Null);
            let input = function
                .get("arguments")
                .and_then(|a| a.as_str())
                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                "name": function.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                "input": input
            }));
        }
    }

    let stop_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(map_finish_reason)
        .unwrap_or("end_turn");

    let prompt_tokens = upstream
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = upstream
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": prompt_tokens,
            "output_tokens": completion_tokens
        }
    })
}

fn chat_chunk(state: &StreamState, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": format!("chatcmpl-{}", if state.response_id.is_empty() { "proxy" } else { state.response_id.as_str() }),
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": state.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason
        }]
    })
}

/// Anthropic SSE event → zero or more OpenAI chat completion chunks.
pub fn claude_stream_to_chat(
    model: &str,
    _original: &Value,
    event: &StreamEvent,
    state: &mut StreamState,
) -> Vec<ClientEvent> {
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    let kind = event
        .event
        .as_deref()
        .or_else(|| event.data.get("type").and_then(|t| t.as_str()))
        .unwrap_or("");

    match kind {
        "message_start" => {
            if let Some(id) = event
                .data
                .get("message")
                .and_then(|m| m.get("id"))
                .and_then(|v| v.as_str())
            {
                state.response_id = id.to_string();
            }
            state.started = true;
            state.role_sent = true;
            vec![ClientEvent::data_only(chat_chunk(
                state,
                json!({"role": "assistant", "content": ""}),
                None,
            ))]
        }
        "content_block_start" => {
            let index = event.data.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let block = event.data.get("content_block").cloned().unwrap_or(Value::Null);
            match block.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    state.block_kind.insert(index, BlockKind::ToolUse);
                    state.block_fn_name.insert(index, name.clone());
                    state.block_tool_id.insert(index, id.clone());
                    vec![ClientEvent::data_only(chat_chunk(
                        state,
                        json!({"tool_calls": [{
                            "index": index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""}
                        }]}),
                        None,
                    ))]
                }
                _ => {
                    state.block_kind.insert(index, BlockKind::Text);
                    Vec::new()
                }
            }
        }
        "content_block_delta" => {
            let index = event.data.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let delta = event.data.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(|t| t.as_str()) {
                Some("text_delta") => {
                    let text = delta.get("text").and_then(|t| t.as_str()).unwrap_or("");
                    state.block_text.entry(index).or_default().push_str(text);
                    vec![ClientEvent::data_only(chat_chunk(
                        state,
                        json!({"content": text}),
                        None,
                    ))]
                }
                Some("input_json_delta") => {
                    let partial = delta.get("partial_json").and_then(|p| p.as_str()).unwrap_or("");
                    state.block_fn_args.entry(index).or_default().push_str(partial);
                    vec![ClientEvent::data_only(chat_chunk(
                        state,
                        json!({"tool_calls": [{
                            "index": index,
                            "function": {"arguments": partial}
                        }]}),
                        None,
                    ))]
                }
                _ => Vec::new(),
            }
        }
        "message_delta" => {
            if let Some(reason) = event
                .data
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|r| r.as_str())
            {
                state.finish_reason = Some(map_stop_reason(reason).to_string());
            }
            if let Some(usage) = event.data.get("usage") {
                state.usage = Some(usage.clone());
            }
            Vec::new()
        }
        "message_stop" => {
            state.completed = true;
            let finish = state.finish_reason.clone().unwrap_or_else(|| "stop".to_string());
            vec![ClientEvent::data_only(chat_chunk(state, json!({}), Some(finish.as_str())))]
        }
        // Pass malformed or unknown chunks through untouched.
        "" => {
            if event.data.is_null() {
                Vec::new()
            } else {
                vec![ClientEvent::data_only(event.data.clone())]
            }
        }
        _ => Vec::new(),
    }
}

pub fn flush_chat(model: &str, state: &mut StreamState) -> Vec<ClientEvent> {
    if state.completed {
        return Vec::new();
    }
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    state.completed = true;
    vec![ClientEvent::data_only(chat_chunk(state, json!({}), Some("stop")))]
}

fn claude_event(name: &str, data: Value) -> ClientEvent {
    ClientEvent::named(name, data)
}

/// OpenAI chat completion chunk → Anthropic SSE events, for Anthropic
/// clients served by OpenAI-dialect upstreams.
pub fn chat_stream_to_claude(
    model: &str,
    _original: &Value,
    event: &StreamEvent,
    state: &mut StreamState,
) -> Vec<ClientEvent> {
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    let data = &event.data;
    let choice = match data.get("choices").and_then(|c| c.get(0)) {
        Some(choice) => choice,
        None => return Vec::new(),
    };

    let mut out: Vec<ClientEvent> = Vec::new();

    if !state.started {
        state.started = true;
        if let Some(id) = data.get("id").and_then(|v| v.as_str()) {
            state.response_id = id.to_string();
        }
        out.push(claude_event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                    "type": "message",
                    "role": "assistant",
                    "model": state.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ));
    }

    let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            if state.block_kind.get(&0) != Some(&BlockKind::Text) {
                state.block_kind.insert(0, BlockKind::Text);
                out.push(claude_event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": {"type": "text", "text": ""}
                    }),
                ));
            }
            state.block_text.entry(0).or_default().push_str(text);
            out.push(claude_event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": text}
                }),
            ));
        }
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for call in tool_calls {
            let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) + 1;
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    state.block_kind.insert(index, BlockKind::ToolUse);
                    state.block_fn_name.insert(index, name.to_string());
                    let id = call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    out.push(claude_event(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                        }),
                    ));
                }
                if let Some(arguments) = function.get("arguments").and_then(|a| a.as_str()) {
                    if !arguments.is_empty() {
                        out.push(claude_event(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": index,
                                "delta": {"type": "input_json_delta", "partial_json": arguments}
                            }),
                        ));
                    }
                }
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        state.completed = true;
        let mut indexes: Vec<u64> = state.block_kind.keys().copied().collect();
        indexes.sort_unstable();
        for index in indexes {
            out.push(claude_event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ));
        }
        let usage = data.get("usage").cloned();
        out.push(claude_event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": map_finish_reason(reason), "stop_sequence": Value::Null},
                "usage": {
                    "output_tokens": usage
                        .as_ref()
                        .and_then(|u| u.get("completion_tokens"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                }
            }),
        ));
        out.push(claude_event("message_stop", json!({"type": "message_stop"})));
    }

    out
}

pub fn flush_claude(model: &str, state: &mut StreamState) -> Vec<ClientEvent> {
    if state.completed {
        return Vec::new();
    }
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    state.completed = true;
    vec![claude_event("message_stop", json!({"type": "message_stop"}))]
}

fn collect_text(content: &Value) -> Vec<String> {
    match content {
        Value::String(text) if !text.is_empty() => vec![text.clone()],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn content_as_string(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            if texts.is_empty() {
                content.to_string()
            } else {
                texts.join("")
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_message_lifts_to_top_level_array() {
        let body = json!({
            "model": "gpt-x",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        });
        let out = chat_request_to_claude("claude-opus-4-5", &body, false);
        assert_eq!(out["model"], "claude-opus-4-5");
        assert_eq!(out["system"], json!([{"type": "text", "text": "be terse"}]));
        assert_eq!(
            out["messages"],
            json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
        );
        assert!(out.get("max_tokens").is_some());
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let body = json!({
            "model": "gpt-x",
            "messages": [
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "12C"}
            ]
        });
        let out = chat_request_to_claude("claude-opus-4-5", &body, false);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"][0]["type"], "tool_use");
        assert_eq!(messages[0]["content"][0]["input"]["city"], "Oslo");
        assert_eq!(messages[1]["content"][0]["type"], "tool_result");
        assert_eq!(messages[1]["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn data_uri_image_becomes_base64_source() {
        let body = json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]}]
        });
        let out = chat_request_to_claude("claude-opus-4-5", &body, false);
        let image = &out["messages"][0]["content"][1];
        assert_eq!(image["source"]["type"], "base64");
        assert_eq!(image["source"]["media_type"], "image/png");
        assert_eq!(image["source"]["data"], "AAAA");
    }

    #[test]
    fn http_image_becomes_url_source() {
        let body = json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]}]
        });
        let out = chat_request_to_claude("claude-opus-4-5", &body, false);
        assert_eq!(out["messages"][0]["content"][0]["source"]["type"], "url");
    }

    #[test]
    fn tool_choice_none_is_omitted() {
        let body = json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "none"
        });
        let out = chat_request_to_claude("claude-opus-4-5", &body, false);
        assert!(out.get("tool_choice").is_none());

        let body = json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "required"
        });
        let out = chat_request_to_claude("claude-opus-4-5", &body, false);
        assert_eq!(out["tool_choice"]["type"], "any");
    }

    #[test]
    fn text_round_trip_preserves_semantics() {
        let body = json!({
            "model": "gpt-x",
            "max_tokens": 100,
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        });
        let claude = chat_request_to_claude("claude-x", &body, false);
        let back = claude_request_to_chat("gpt-x", &claude, false);
        assert_eq!(back["model"], "gpt-x");
        assert_eq!(back["max_tokens"], 100);
        let messages = back["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be terse");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["content"], "hello");
    }

    #[test]
    fn claude_response_maps_to_chat_completion() {
        let upstream = json!({
            "id": "msg_01",
            "content": [{"type": "text", "text": "hello there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 3}
        });
        let out = claude_response_to_chat("gpt-x", &Value::Null, &upstream);
        assert_eq!(out["choices"][0]["message"]["content"], "hello there");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 12);
    }

    #[test]
    fn tool_use_response_maps_finish_reason() {
        let upstream = json!({
            "id": "msg_02",
            "content": [{"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "x"}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let out = claude_response_to_chat("gpt-x", &Value::Null, &upstream);
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        let call = &out["choices"][0]["message"]["tool_calls"][0];
        assert_eq!(call["function"]["name"], "search");
        assert_eq!(
            serde_json::from_str::<Value>(call["function"]["arguments"].as_str().unwrap()).unwrap(),
            json!({"q": "x"})
        );
    }

    fn event(name: &str, data: Value) -> StreamEvent {
        StreamEvent {
            event: Some(name.to_string()),
            data,
        }
    }

    #[test]
    fn stream_deltas_concatenate_to_final_text() {
        let mut state = StreamState::new("gpt-x");
        let mut text = String::new();
        let events = [
            event("message_start", json!({"type": "message_start", "message": {"id": "msg_1"}})),
            event("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}})),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            event("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}})),
            event("message_stop", json!({"type": "message_stop"})),
        ];
        let mut chunks = Vec::new();
        for e in &events {
            chunks.extend(claude_stream_to_chat("gpt-x", &Value::Null, e, &mut state));
        }
        for chunk in &chunks {
            if let Some(content) = chunk.data["choices"][0]["delta"]["content"].as_str() {
                text.push_str(content);
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(state.block_text.get(&0).unwrap(), "Hello");
        let last = chunks.last().unwrap();
        assert_eq!(last.data["choices"][0]["finish_reason"], "stop");
        assert!(state.completed);
        // Flush after completion emits nothing further.
        assert!(flush_chat("gpt-x", &mut state).is_empty());
    }

    #[test]
    fn empty_stream_flushes_synthetic_terminal_chunk() {
        let mut state = StreamState::new("gpt-x");
        let out = flush_chat("gpt-x", &mut state);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn chat_chunks_translate_to_claude_events() {
        let mut state = StreamState::new("claude-x");
        let first = StreamEvent {
            event: None,
            data: json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hi"}, "finish_reason": null}]
            }),
        };
        let events = chat_stream_to_claude("claude-x", &Value::Null, &first, &mut state);
        let names: Vec<_> = events.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(names, vec!["message_start", "content_block_start", "content_block_delta"]);

        let last = StreamEvent {
            event: None,
            data: json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
            }),
        };
        let events = chat_stream_to_claude("claude-x", &Value::Null, &last, &mut state);
        let names: Vec<_> = events.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(names, vec!["content_block_stop", "message_delta", "message_stop"]);
        assert!(state.completed);
    }
}
