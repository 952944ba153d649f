// Conversions between the OpenAI Responses API and Anthropic Messages.
// The streaming direction rebuilds the Responses event sequence
// (response.created ... response.completed) with monotonic sequence
// numbers from the Anthropic block events.

use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::{BlockKind, ClientEvent, StreamEvent, StreamState};

const DEFAULT_MAX_TOKENS: u64 = 32000;

/// Process-stable metadata user id, derived once the way Anthropic clients
/// derive theirs: a hash of generated account and session identifiers.
static USER_ID: Lazy<String> = Lazy::new(|| {
    let account = uuid::Uuid::new_v4().to_string();
    let session = uuid::Uuid::new_v4().to_string();
    let mut hasher = Sha256::new();
    hasher.update(account.as_bytes());
    hasher.update(session.as_bytes());
    let user = format!("{:x}", hasher.finalize());
    format!("user_{user}_account_{account}_session_{session}")
});

fn generate_tool_call_id() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect();
    format!("toolu_{suffix}")
}

/// OpenAI Responses request → Anthropic Messages request.
/// - `instructions` and system input messages → top-level `system`
/// - `input[].type=message` with input_text/output_text → user/assistant
/// - `function_call` → assistant tool_use, `function_call_output` → user tool_result
/// - `tools[].parameters` → `tools[].input_schema`
/// - `max_output_tokens` → `max_tokens`
pub fn responses_request_to_claude(model: &str, body: &Value, stream: bool) -> Value {
    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert(
        "max_tokens".into(),
        json!(body
            .get("max_output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    out.insert("stream".into(), json!(stream));
    out.insert("metadata".into(), json!({"user_id": *USER_ID}));

    let mut system_parts: Vec<Value> = Vec::new();
    if let Some(instructions) = body.get("instructions").and_then(|v| v.as_str()) {
        if !instructions.is_empty() {
            system_parts.push(json!({"type": "text", "text": instructions}));
        }
    }

    let input = body.get("input").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    // First pass collects system content so it never lands in messages.
    for item in &input {
        if item
            .get("role")
            .and_then(|r| r.as_str())
            .map(|r| r.eq_ignore_ascii_case("system"))
            .unwrap_or(false)
        {
            if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            system_parts.push(json!({"type": "text", "text": text}));
                        }
                    }
                }
            }
        }
    }
    if !system_parts.is_empty() {
        out.insert("system".into(), Value::Array(system_parts));
    }

    let mut messages: Vec<Value> = Vec::new();
    for item in &input {
        if item
            .get("role")
            .and_then(|r| r.as_str())
            .map(|r| r.eq_ignore_ascii_case("system"))
            .unwrap_or(false)
        {
            continue;
        }
        let item_type = item
            .get("type")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                if item.get("role").is_some() {
                    "message"
                } else {
                    ""
                }
            });
        match item_type {
            "message" => {
                if let Some(message) = convert_responses_message(item) {
                    messages.push(message);
                }
            }
            "function_call" => {
                let call_id = item
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .filter(|v| !v.is_empty())
                    .map(String::from)
                    .unwrap_or_else(generate_tool_call_id);
                let input_value = item
                    .get("arguments")
                    .and_then(|a| a.as_str())
                    .and_then(|a| serde_json::from_str::<Value>(a).ok())
                    .unwrap_or_else(|| json!({}));
                messages.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": call_id,
                        "name": item.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "input": input_value
                    }]
                }));
            }
            "function_call_output" => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": item.get("call_id").and_then(|v| v.as_str()).unwrap_or(""),
                        "content": item.get("output").and_then(|o| o.as_str()).unwrap_or("")
                    }]
                }));
            }
            _ => {}
        }
    }
    out.insert("messages".into(), Value::Array(messages));

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut entry = Map::new();
                entry.insert(
                    "name".into(),
                    json!(tool.get("name").and_then(|n| n.as_str()).unwrap_or("")),
                );
                if let Some(description) = tool.get("description") {
                    entry.insert("description".into(), description.clone());
                }
                let schema = tool
                    .get("parameters")
                    .or_else(|| tool.get("parametersJsonSchema"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                entry.insert("input_schema".into(), schema);
                Value::Object(entry)
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
            _ => {}
        },
        Some(choice @ Value::Object(_)) => {
            if choice.get("type").and_then(|t| t.as_str()) == Some("function") {
                let name = choice
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|n| n.as_str())
                    .or_else(|| choice.get("name").and_then(|n| n.as_str()))
                    .unwrap_or("");
                out.insert("tool_choice".into(), json!({"type": "tool", "name": name}));
            }
        }
        _ => {}
    }

    Value::Object(out)
}

fn convert_responses_message(item: &Value) -> Option<Value> {
    let mut role = String::new();
    let mut parts: Vec<Value> = Vec::new();
    if let Some(content) = item.get("content").and_then(|c| c.as_array()) {
        for part in content {
            match part.get("type").and_then(|t| t.as_str()) {
                Some(part_type @ ("input_text" | "output_text")) => {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        parts.push(json!({"type": "text", "text": text}));
                    }
                    role = if part_type == "input_text" {
                        "user".into()
                    } else {
                        "assistant".into()
                    };
                }
                Some("input_image") => {
                    let url = part
                        .get("image_url")
                        .and_then(|u| u.as_str())
                        .or_else(|| part.get("url").and_then(|u| u.as_str()))
                        .unwrap_or("");
                    if let Some(rest) = url.strip_prefix("data:") {
                        if let Some((media_type, data)) = rest.split_once(";base64,") {
                            if !data.is_empty() {
                                let media_type = if media_type.is_empty() {
                                    "application/octet-stream"
                                } else {
                                    media_type
                                };
                                parts.push(json!({
                                    "type": "image",
                                    "source": {"type": "base64", "media_type": media_type, "data": data}
                                }));
                            }
                        }
                    } else if !url.is_empty() {
                        parts.push(json!({
                            "type": "image",
                            "source": {"type": "url", "url": url}
                        }));
                    }
                    if role.is_empty() {
                        role = "user".into();
                    }
                }
                _ => {}
            }
        }
    }
    if role.is_empty() {
        role = match item.get("role").and_then(|r| r.as_str()) {
            Some(r @ ("user" | "assistant")) => r.to_string(),
            _ => "user".into(),
        };
    }
    if parts.is_empty() {
        return None;
    }
    // Single text part keeps the compact string form.
    if parts.len() == 1 && parts[0].get("type").and_then(|t| t.as_str()) == Some("text") {
        return Some(json!({"role": role, "content": parts[0]["text"]}));
    }
    Some(json!({"role": role, "content": parts}))
}

pub(super) fn map_stop_reason_to_status(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "incomplete",
        _ => "completed",
    }
}

/// Anthropic Messages response → OpenAI Responses response.
pub fn claude_response_to_responses(model: &str, _original: &Value, upstream: &Value) -> Value {
    let response_id = format!(
        "resp_{}",
        upstream
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("proxy")
            .trim_start_matches("msg_")
    );
    let mut output: Vec<Value> = Vec::new();
    if let Some(blocks) = upstream.get("content").and_then(|c| c.as_array()) {
        for (index, block) in blocks.iter().enumerate() {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    output.push(json!({
                        "type": "message",
                        "id": format!("msg_{response_id}_{index}"),
                        "status": "completed",
                        "role": "assistant",
                        "content": [{
                            "type": "output_text",
                            "text": block.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                            "annotations": []
                        }]
                    }));
                }
                Some("tool_use") => {
                    output.push(json!({
                        "type": "function_call",
                        "id": format!("fc_{response_id}_{index}"),
                        "call_id": block.get("id").and_then(|v| v.as_str()).unwrap_or(""),
                        "name": block.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "arguments": block.get("input").map(|i| i.to_string()).unwrap_or_else(|| "{}".into()),
                        "status": "completed"
                    }));
                }
                _ => {}
            }
        }
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
        "id": response_id,
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "status": map_stop_reason_to_status(upstream.get("stop_reason").and_then(|r| r.as_str())),
        "error": Value::Null,
        "incomplete_details": Value::Null,
        "model": model,
        "output": output,
        "parallel_tool_calls": true,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens
        },
        "metadata": {}
    })
}

/// The canonical response envelope carried by lifecycle events. The
/// `response.created` event must include an empty `output` array and the
/// full envelope; clients close the connection otherwise.
pub(super) fn response_envelope(state: &StreamState, status: &str, output: Vec<Value>) -> Value {
    let usage = state.usage.as_ref().map(|usage| {
        let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output_tokens = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        json!({
            "input_tokens": input,
            "output_tokens": output_tokens,
            "total_tokens": input + output_tokens
        })
    });
    json!({
        "id": state.response_id,
        "object": "response",
        "created_at": state.created,
        "status": status,
        "error": Value::Null,
        "incomplete_details": Value::Null,
        "instructions": Value::Null,
        "max_output_tokens": Value::Null,
        "model": state.model,
        "output": output,
        "parallel_tool_calls": true,
        "previous_response_id": Value::Null,
        "temperature": 1.0,
        "tool_choice": "auto",
        "tools": [],
        "top_p": 1.0,
        "truncation": "disabled",
        "usage": usage.unwrap_or(Value::Null),
        "user": Value::Null,
        "metadata": {}
    })
}

pub(super) fn seq_event(state: &mut StreamState, name: &str, mut data: Value) -> ClientEvent {
    data["type"] = json!(name);
    data["sequence_number"] = json!(state.next_sequence());
    ClientEvent::named(name, data)
}

pub(super) fn message_item_id(state: &StreamState, index: u64) -> String {
    format!("msg_{}_{index}", state.response_id.trim_start_matches("resp_"))
}

pub(super) fn function_item_id(state: &StreamState, index: u64) -> String {
    format!("fc_{}_{index}", state.response_id.trim_start_matches("resp_"))
}

/// Anthropic SSE event → OpenAI Responses event sequence. Every emitted
/// event carries a monotonically increasing `sequence_number` starting at
/// 0; done events carry accumulated content, never an empty string.
pub fn claude_stream_to_responses(
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
            let message_id = event
                .data
                .get("message")
                .and_then(|m| m.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or("proxy");
            state.response_id = format!("resp_{}", message_id.trim_start_matches("msg_"));
            if let Some(usage) = event.data.get("message").and_then(|m| m.get("usage")) {
                state.usage = Some(usage.clone());
            }
            state.started = true;
            let created = response_envelope(state, "in_progress", Vec::new());
            let in_progress = created.clone();
            vec![
                seq_event(state, "response.created", json!({"response": created})),
                seq_event(state, "response.in_progress", json!({"response": in_progress})),
            ]
        }
        "content_block_start" => {
            let index = event.data.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let block = event.data.get("content_block").cloned().unwrap_or(Value::Null);
            match block.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    state.block_kind.insert(index, BlockKind::ToolUse);
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
                    let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    state.block_fn_name.insert(index, name.clone());
                    state.block_tool_id.insert(index, call_id.clone());
                    let item_id = function_item_id(state, index);
                    vec![seq_event(
                        state,
                        "response.output_item.added",
                        json!({
                            "output_index": index,
                            "item": {
                                "type": "function_call",
                                "id": item_id,
                                "call_id": call_id,
                                "name": name,
                                "arguments": "",
                                "status": "in_progress"
                            }
                        }),
                    )]
                }
                _ => {
                    state.block_kind.insert(index, BlockKind::Text);
                    let item_id = message_item_id(state, index);
                    let added = seq_event(
                        state,
                        "response.output_item.added",
                        json!({
                            "output_index": index,
                            "item": {
                                "type": "message",
                                "id": item_id,
                                "status": "in_progress",
                                "role": "assistant",
                                "content": []
                            }
                        }),
                    );
                    let item_id = message_item_id(state, index);
                    let part_added = seq_event(
                        state,
                        "response.content_part.added",
                        json!({
                            "item_id": item_id,
                            "output_index": index,
                            "content_index": 0,
                            "part": {"type": "output_text", "text": "", "annotations": []}
                        }),
                    );
                    vec![added, part_added]
                }
            }
        }
        "content_block_delta" => {
            let index = event.data.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let delta = event.data.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(|t| t.as_str()) {
                Some("text_delta") => {
                    let text = delta.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string();
                    state.block_text.entry(index).or_default().push_str(&text);
                    let item_id = message_item_id(state, index);
                    vec![seq_event(
                        state,
                        "response.output_text.delta",
                        json!({
                            "item_id": item_id,
                            "output_index": index,
                            "content_index": 0,
                            "delta": text
                        }),
                    )]
                }
                Some("input_json_delta") => {
                    let partial = delta
                        .get("partial_json")
                        .and_then(|p| p.as_str())
                        .unwrap_or("")
                        .to_string();
                    state.block_fn_args.entry(index).or_default().push_str(&partial);
                    let item_id = function_item_id(state, index);
                    vec![seq_event(
                        state,
                        "response.function_call_arguments.delta",
                        json!({
                            "item_id": item_id,
                            "output_index": index,
                            "delta": partial
                        }),
                    )]
                }
                _ => Vec::new(),
            }
        }
        "content_block_stop" => {
            let index = event.data.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            match state.block_kind.get(&index).copied() {
                Some(BlockKind::ToolUse) => {
                    let name = state.block_fn_name.get(&index).cloned().unwrap_or_default();
                    let call_id = state.block_tool_id.get(&index).cloned().unwrap_or_default();
                    let arguments = state.block_fn_args.get(&index).cloned().unwrap_or_default();
                    let item_id = function_item_id(state, index);
                    let item = json!({
                        "type": "function_call",
                        "id": item_id,
                        "call_id": call_id,
                        "name": name,
                        "arguments": arguments,
                        "status": "completed"
                    });
                    state.finished_items.push(item.clone());
                    let args_done = seq_event(
                        state,
                        "response.function_call_arguments.done",
                        json!({
                            "item_id": item["id"],
                            "output_index": index,
                            "name": name,
                            "arguments": arguments
                        }),
                    );
                    let item_done = seq_event(
                        state,
                        "response.output_item.done",
                        json!({"output_index": index, "item": item}),
                    );
                    vec![args_done, item_done]
                }
                _ => {
                    let text = state.block_text.get(&index).cloned().unwrap_or_default();
                    let item_id = message_item_id(state, index);
                    let item = json!({
                        "type": "message",
                        "id": item_id,
                        "status": "completed",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text, "annotations": []}]
                    });
                    state.finished_items.push(item.clone());
                    let item_id = message_item_id(state, index);
                    let text_done = seq_event(
                        state,
                        "response.output_text.done",
                        json!({
                            "item_id": item_id,
                            "output_index": index,
                            "content_index": 0,
                            "text": text
                        }),
                    );
                    let part_done = seq_event(
                        state,
                        "response.content_part.done",
                        json!({
                            "item_id": item["id"],
                            "output_index": index,
                            "content_index": 0,
                            "part": {"type": "output_text", "text": item["content"][0]["text"], "annotations": []}
                        }),
                    );
                    let item_done = seq_event(
                        state,
                        "response.output_item.done",
                        json!({"output_index": index, "item": item}),
                    );
                    vec![text_done, part_done, item_done]
                }
            }
        }
        "message_delta" => {
            if let Some(usage) = event.data.get("usage") {
                state.usage = Some(usage.clone());
            }
            if let Some(reason) = event
                .data
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|r| r.as_str())
            {
                state.finish_reason = Some(reason.to_string());
            }
            Vec::new()
        }
        "message_stop" => {
            state.completed = true;
            let status = map_stop_reason_to_status(state.finish_reason.as_deref());
            let envelope = response_envelope(state, status, state.finished_items.clone());
            vec![seq_event(state, "response.completed", json!({"response": envelope}))]
        }
        // Chunks the upstream parser could not type pass through verbatim.
        "" if !event.data.is_null() => vec![ClientEvent::data_only(event.data.clone())],
        _ => Vec::new(),
    }
}

/// Synthetic `response.completed` for streams that end without one, so the
/// client always sees a terminal event.
pub fn flush_responses(model: &str, state: &mut StreamState) -> Vec<ClientEvent> {
    if state.completed {
        return Vec::new();
    }
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    if state.response_id.is_empty() {
        state.response_id = format!("resp_{}", uuid::Uuid::new_v4().simple());
    }
    state.completed = true;
    let envelope = response_envelope(state, "completed", state.finished_items.clone());
    vec![seq_event(state, "response.completed", json!({"response": envelope}))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instructions_and_input_map_to_claude_request() {
        let body = json!({
            "model": "gpt-5",
            "instructions": "answer briefly",
            "max_output_tokens": 2048,
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]},
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "hello"}]}
            ]
        });
        let out = responses_request_to_claude("claude-opus-4-5", &body, false);
        assert_eq!(out["model"], "claude-opus-4-5");
        assert_eq!(out["max_tokens"], 2048);
        assert_eq!(out["system"][0]["text"], "answer briefly");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0], json!({"role": "user", "content": "hi"}));
        assert_eq!(messages[1], json!({"role": "assistant", "content": "hello"}));
        assert!(out["metadata"]["user_id"].as_str().unwrap().starts_with("user_"));
    }

    #[test]
    fn function_calls_round_into_tool_blocks() {
        let body = json!({
            "input": [
                {"type": "function_call", "call_id": "call_9", "name": "lookup", "arguments": "{\"q\":1}"},
                {"type": "function_call_output", "call_id": "call_9", "output": "found"}
            ]
        });
        let out = responses_request_to_claude("claude-x", &body, false);
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["content"][0]["type"], "tool_use");
        assert_eq!(messages[0]["content"][0]["input"]["q"], 1);
        assert_eq!(messages[1]["content"][0]["type"], "tool_result");
        assert_eq!(messages[1]["content"][0]["content"], "found");
    }

    #[test]
    fn tools_parameters_become_input_schema() {
        let body = json!({
            "input": [],
            "tools": [{"type": "function", "name": "search", "description": "d", "parameters": {"type": "object"}}]
        });
        let out = responses_request_to_claude("claude-x", &body, false);
        assert_eq!(out["tools"][0]["name"], "search");
        assert_eq!(out["tools"][0]["input_schema"]["type"], "object");
    }

    fn event(name: &str, data: Value) -> StreamEvent {
        StreamEvent {
            event: Some(name.to_string()),
            data,
        }
    }

    #[test]
    fn stream_produces_canonical_event_sequence() {
        let mut state = StreamState::new("gpt-5");
        let anthropic_events = [
            event("message_start", json!({"type": "message_start", "message": {"id": "msg_abc", "usage": {"input_tokens": 4}}})),
            event("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}})),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
            event("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"input_tokens": 4, "output_tokens": 2}})),
            event("message_stop", json!({"type": "message_stop"})),
        ];
        let mut emitted = Vec::new();
        for e in &anthropic_events {
            emitted.extend(claude_stream_to_responses("gpt-5", &Value::Null, e, &mut state));
        }
        let names: Vec<_> = emitted.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
        // Sequence numbers are monotonic from zero.
        for (i, e) in emitted.iter().enumerate() {
            assert_eq!(e.data["sequence_number"], json!(i as u64));
        }
        // response.created carries the empty output envelope.
        assert_eq!(emitted[0].data["response"]["output"], json!([]));
        assert_eq!(emitted[0].data["response"]["object"], "response");
        // Done events carry accumulated text.
        let text_done = emitted.iter().find(|e| e.event.as_deref() == Some("response.output_text.done")).unwrap();
        assert_eq!(text_done.data["text"], "Hello");
        let item_done = emitted.iter().find(|e| e.event.as_deref() == Some("response.output_item.done")).unwrap();
        assert_eq!(item_done.data["item"]["content"][0]["text"], "Hello");
        // Terminal event carries the full output and usage.
        let completed = emitted.last().unwrap();
        assert_eq!(completed.data["response"]["status"], "completed");
        assert_eq!(completed.data["response"]["output"][0]["content"][0]["text"], "Hello");
        assert_eq!(completed.data["response"]["usage"]["total_tokens"], 6);
    }

    #[test]
    fn function_call_done_events_carry_name() {
        let mut state = StreamState::new("gpt-5");
        let events = [
            event("message_start", json!({"type": "message_start", "message": {"id": "msg_fc"}})),
            event("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search_web", "input": {}}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}})),
            event("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "\"rust\"}"}})),
            event("content_block_stop", json!({"type": "content_block_stop", "index": 0})),
        ];
        let mut emitted = Vec::new();
        for e in &events {
            emitted.extend(claude_stream_to_responses("gpt-5", &Value::Null, e, &mut state));
        }
        let args_done = emitted
            .iter()
            .find(|e| e.event.as_deref() == Some("response.function_call_arguments.done"))
            .unwrap();
        assert_eq!(args_done.data["name"], "search_web");
        assert_eq!(args_done.data["arguments"], "{\"q\":\"rust\"}");
        let item_done = emitted
            .iter()
            .find(|e| e.event.as_deref() == Some("response.output_item.done"))
            .unwrap();
        assert_eq!(item_done.data["item"]["call_id"], "toolu_1");
    }

    #[test]
    fn empty_stream_flushes_synthetic_completed() {
        let mut state = StreamState::new("gpt-5");
        let out = flush_responses("gpt-5", &mut state);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event.as_deref(), Some("response.completed"));
        assert_eq!(out[0].data["response"]["output"], json!([]));
        // Flushing twice emits nothing more.
        assert!(flush_responses("gpt-5", &mut state).is_empty());
    }

    #[test]
    fn nonstream_response_translates_blocks() {
        let upstream = json!({
            "id": "msg_9",
            "content": [
                {"type": "text", "text": "answer"},
                {"type": "tool_use", "id": "toolu_2", "name": "calc", "input": {"a": 1}}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 3}
        });
        let out = claude_response_to_responses("gpt-5", &Value::Null, &upstream);
        assert_eq!(out["object"], "response");
        assert_eq!(out["output"][0]["content"][0]["text"], "answer");
        assert_eq!(out["output"][1]["type"], "function_call");
        assert_eq!(out["output"][1]["name"], "calc");
        assert_eq!(out["usage"]["total_tokens"], 5);
    }
}
