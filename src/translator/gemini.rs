// Conversions between the OpenAI dialects (Chat Completions and
// Responses) and the Gemini v1beta generateContent API, plus the Code
// Assist envelope used by OAuth credentials.

use serde_json::{json, Map, Value};

use super::responses_claude::{
    function_item_id, message_item_id, response_envelope, seq_event,
};
use super::{BlockKind, ClientEvent, StreamEvent, StreamState};

pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" => "content_filter",
        _ => "stop",
    }
}

/// OpenAI Chat Completions request → Gemini generateContent request.
/// System messages become `systemInstruction`; user/assistant roles map to
/// `user`/`model`; generation knobs land under `generationConfig`.
pub fn chat_request_to_gemini(_model: &str, body: &Value, _stream: bool) -> Value {
    let messages = match body.get("messages").and_then(|m| m.as_array()) {
        Some(messages) => messages,
        None => return body.clone(),
    };

    let mut out = Map::new();
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
        let content = message.get("content").unwrap_or(&Value::Null);
        match role {
            "system" | "developer" => {
                for text in text_parts_of(content) {
                    system_parts.push(json!({"text": text}));
                }
            }
            "tool" => {
                let name = message
                    .get("name")
                    .and_then(|n| n.as_str())
                    .or_else(|| message.get("tool_call_id").and_then(|v| v.as_str()))
                    .unwrap_or("tool");
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"result": text_of(content)}
                        }
                    }]
                }));
            }
            "user" | "assistant" => {
                let gemini_role = if role == "assistant" { "model" } else { "user" };
                let mut parts: Vec<Value> = Vec::new();
                match content {
                    Value::String(text) => {
                        if !text.is_empty() {
                            parts.push(json!({"text": text}));
                        }
                    }
                    Value::Array(items) => {
                        for item in items {
                            match item.get("type").and_then(|t| t.as_str()) {
                                Some("text") => {
                                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                                        parts.push(json!({"text": text}));
                                    }
                                }
                                Some("image_url") => {
                                    if let Some(url) = item
                                        .get("image_url")
                                        .and_then(|i| i.get("url"))
                                        .and_then(|u| u.as_str())
                                    {
                                        if let Some(part) = image_url_to_part(url) {
                                            parts.push(part);
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
                            let function = call.get("function").unwrap_or(&Value::Null);
                            let args = function
                                .get("arguments")
                                .and_then(|a| a.as_str())
                                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                                .unwrap_or_else(|| json!({}));
                            parts.push(json!({
                                "functionCall": {
                                    "name": function.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                                    "args": args
                                }
                            }));
                        }
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": gemini_role, "parts": parts}));
                }
            }
            _ => {}
        }
    }

    if !system_parts.is_empty() {
        out.insert("systemInstruction".into(), json!({"parts": system_parts}));
    }
    out.insert("contents".into(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(temperature) = body.get("temperature").and_then(|v| v.as_f64()) {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = body.get("top_p").and_then(|v| v.as_f64()) {
        generation.insert("topP".into(), json!(top_p));
    }
    if let Some(max_tokens) = body.get("max_tokens").and_then(|v| v.as_u64()) {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    match body.get("stop") {
        Some(Value::String(stop)) => {
            generation.insert("stopSequences".into(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            generation.insert("stopSequences".into(), json!(stops));
        }
        _ => {}
    }
    if !generation.is_empty() {
        out.insert("generationConfig".into(), Value::Object(generation));
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "name": function.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                    "description": function.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                    "parameters": function.get("parameters").cloned().unwrap_or_else(|| json!({}))
                }))
            })
            .collect();
        if !declarations.is_empty() {
            out.insert("tools".into(), json!([{"functionDeclarations": declarations}]));
        }
    }

    Value::Object(out)
}

fn image_url_to_part(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (mime_type, data) = rest.split_once(";base64,")?;
        if data.is_empty() {
            return None;
        }
        Some(json!({
            "inlineData": {
                "mimeType": if mime_type.is_empty() { "application/octet-stream" } else { mime_type },
                "data": data
            }
        }))
    } else {
        Some(json!({
            "fileData": {"mimeType": "image/*", "fileUri": url}
        }))
    }
}

/// Wraps a Gemini payload in the Code Assist envelope used by the internal
/// CLI endpoint. The inner payload is unchanged.
pub fn wrap_code_assist(model: &str, project: &str, request: &Value) -> Value {
    json!({
        "project": project,
        "request": request,
        "model": model
    })
}

/// Code Assist responses nest the Gemini payload under `response`.
pub fn unwrap_code_assist(body: &Value) -> Value {
    body.get("response").cloned().unwrap_or_else(|| body.clone())
}

fn candidate_text(data: &Value) -> (String, Vec<Value>) {
    let mut text = String::new();
    let mut thought = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    if let Some(parts) = data
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(json!({
                    "id": format!("call_{}", uuid::Uuid::new_v4().simple()),
                    "type": "function",
                    "function": {
                        "name": call.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "arguments": call.get("args").map(|a| a.to_string()).unwrap_or_else(|| "{}".into())
                    }
                }));
                continue;
            }
            let part_text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
            if part_text.is_empty() {
                continue;
            }
            if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                thought.push_str(part_text);
            } else {
                text.push_str(part_text);
            }
        }
    }
    // Thought-only chunks still surface as content rather than vanishing.
    if text.is_empty() {
        text = thought;
    }
    (text, tool_calls)
}

fn candidate_finish_reason(data: &Value) -> Option<&'static str> {
    data.get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
        .map(map_finish_reason)
}

/// Gemini generateContent response → OpenAI chat completion.
pub fn gemini_response_to_chat(model: &str, _original: &Value, upstream: &Value) -> Value {
    let upstream = unwrap_code_assist(upstream);
    let (text, tool_calls) = candidate_text(&upstream);
    let finish_reason = if tool_calls.is_empty() {
        candidate_finish_reason(&upstream).unwrap_or("stop")
    } else {
        "tool_calls"
    };

    let prompt_tokens = upstream
        .get("usageMetadata")
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = upstream
        .get("usageMetadata")
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

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

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

/// One Gemini stream chunk → one OpenAI chat completion chunk.
pub fn gemini_stream_to_chat(
    model: &str,
    _original: &Value,
    event: &StreamEvent,
    state: &mut StreamState,
) -> Vec<ClientEvent> {
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    let data = unwrap_code_assist(&event.data);
    let (text, tool_calls) = candidate_text(&data);
    let finish_reason = candidate_finish_reason(&data);
    if text.is_empty() && tool_calls.is_empty() && finish_reason.is_none() {
        return Vec::new();
    }

    let is_first = !state.started;
    state.started = true;
    if !text.is_empty() {
        state.block_text.entry(0).or_default().push_str(&text);
    }
    if let Some(usage) = data.get("usageMetadata") {
        state.usage = Some(usage.clone());
    }
    if finish_reason.is_some() {
        state.completed = true;
    }

    let mut delta = Map::new();
    if is_first {
        delta.insert("role".into(), json!("assistant"));
    }
    if !tool_calls.is_empty() {
        let indexed: Vec<Value> = tool_calls
            .into_iter()
            .enumerate()
            .map(|(i, mut call)| {
                call["index"] = json!(i);
                call
            })
            .collect();
        delta.insert("tool_calls".into(), Value::Array(indexed));
    } else {
        delta.insert("content".into(), json!(text));
    }

    vec![ClientEvent::data_only(json!({
        "id": format!("chatcmpl-{}", if state.response_id.is_empty() { "proxy" } else { state.response_id.as_str() }),
        "object": "chat.completion.chunk",
        "created": state.created,
        "model": state.model,
        "choices": [{
            "index": 0,
            "delta": Value::Object(delta),
            "finish_reason": finish_reason
        }]
    }))]
}

pub fn flush_chat(model: &str, state: &mut StreamState) -> Vec<ClientEvent> {
    super::openai_claude::flush_chat(model, state)
}

/// OpenAI Responses request → Gemini generateContent request.
/// `instructions` and system input messages become `systemInstruction`;
/// input items map onto `contents[]` the same way the chat dialect does.
pub fn responses_request_to_gemini(_model: &str, body: &Value, _stream: bool) -> Value {
    let input = match body.get("input").and_then(|v| v.as_array()) {
        Some(input) => input,
        None => return body.clone(),
    };

    let mut out = Map::new();
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    if let Some(instructions) = body.get("instructions").and_then(|v| v.as_str()) {
        if !instructions.is_empty() {
            system_parts.push(json!({"text": instructions}));
        }
    }

    for item in input {
        let role = item.get("role").and_then(|r| r.as_str()).unwrap_or("");
        if role.eq_ignore_ascii_case("system") {
            if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            system_parts.push(json!({"text": text}));
                        }
                    }
                }
            }
            continue;
        }
        let item_type = item
            .get("type")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| if item.get("role").is_some() { "message" } else { "" });
        match item_type {
            "message" => {
                let mut gemini_role = if role == "assistant" { "model" } else { "user" };
                let mut parts: Vec<Value> = Vec::new();
                if let Some(content) = item.get("content").and_then(|c| c.as_array()) {
                    for part in content {
                        match part.get("type").and_then(|t| t.as_str()) {
                            Some(part_type @ ("input_text" | "output_text")) => {
                                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                    parts.push(json!({"text": text}));
                                }
                                if part_type == "output_text" {
                                    gemini_role = "model";
                                }
                            }
                            Some("input_image") => {
                                let url = part
                                    .get("image_url")
                                    .and_then(|u| u.as_str())
                                    .or_else(|| part.get("url").and_then(|u| u.as_str()))
                                    .unwrap_or("");
                                if !url.is_empty() {
                                    if let Some(part) = image_url_to_part(url) {
                                        parts.push(part);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": gemini_role, "parts": parts}));
                }
            }
            "function_call" => {
                let args = item
                    .get("arguments")
                    .and_then(|a| a.as_str())
                    .and_then(|a| serde_json::from_str::<Value>(a).ok())
                    .unwrap_or_else(|| json!({}));
                contents.push(json!({
                    "role": "model",
                    "parts": [{
                        "functionCall": {
                            "name": item.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                            "args": args
                        }
                    }]
                }));
            }
            "function_call_output" => {
                let name = item
                    .get("name")
                    .and_then(|n| n.as_str())
                    .or_else(|| item.get("call_id").and_then(|v| v.as_str()))
                    .unwrap_or("tool");
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"result": item.get("output").and_then(|o| o.as_str()).unwrap_or("")}
                        }
                    }]
                }));
            }
            _ => {}
        }
    }

    if !system_parts.is_empty() {
        out.insert("systemInstruction".into(), json!({"parts": system_parts}));
    }
    out.insert("contents".into(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(temperature) = body.get("temperature").and_then(|v| v.as_f64()) {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = body.get("top_p").and_then(|v| v.as_f64()) {
        generation.insert("topP".into(), json!(top_p));
    }
    if let Some(max_tokens) = body.get("max_output_tokens").and_then(|v| v.as_u64()) {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if !generation.is_empty() {
        out.insert("generationConfig".into(), Value::Object(generation));
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name").and_then(|n| n.as_str())?;
                Some(json!({
                    "name": name,
                    "description": tool.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                    "parameters": tool.get("parameters").cloned().unwrap_or_else(|| json!({}))
                }))
            })
            .collect();
        if !declarations.is_empty() {
            out.insert("tools".into(), json!([{"functionDeclarations": declarations}]));
        }
    }

    Value::Object(out)
}

fn gemini_status(data: &Value) -> &'static str {
    match candidate_finish_reason(data) {
        Some("length") => "incomplete",
        _ => "completed",
    }
}

/// Gemini generateContent response → OpenAI Responses response.
pub fn gemini_response_to_responses(model: &str, _original: &Value, upstream: &Value) -> Value {
    let upstream = unwrap_code_assist(upstream);
    let response_id = format!("resp_{}", uuid::Uuid::new_v4().simple());
    let (text, tool_calls) = candidate_text(&upstream);

    let item_stem = response_id.trim_start_matches("resp_").to_string();
    let mut output: Vec<Value> = Vec::new();
    if !text.is_empty() {
        output.push(json!({
            "type": "message",
            "id": format!("msg_{item_stem}_0"),
            "status": "completed",
            "role": "assistant",
            "content": [{"type": "output_text", "text": text, "annotations": []}]
        }));
    }
    for (index, call) in tool_calls.iter().enumerate() {
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        output.push(json!({
            "type": "function_call",
            "id": format!("fc_{item_stem}_{index}"),
            "call_id": call.get("id").and_then(|v| v.as_str()).unwrap_or(""),
            "name": function.get("name").and_then(|n| n.as_str()).unwrap_or(""),
            "arguments": function.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}"),
            "status": "completed"
        }));
    }

    let prompt_tokens = upstream
        .get("usageMetadata")
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = upstream
        .get("usageMetadata")
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": response_id,
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "status": gemini_status(&upstream),
        "error": Value::Null,
        "incomplete_details": Value::Null,
        "model": model,
        "output": output,
        "parallel_tool_calls": true,
        "usage": {
            "input_tokens": prompt_tokens,
            "output_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        },
        "metadata": {}
    })
}

/// Gemini stream chunk → OpenAI Responses event sequence. Gemini delivers
/// whole function calls per chunk, so their added/done events emit
/// together; text accumulates across chunks into the done events.
pub fn gemini_stream_to_responses(
    model: &str,
    _original: &Value,
    event: &StreamEvent,
    state: &mut StreamState,
) -> Vec<ClientEvent> {
    if state.model.is_empty() {
        state.model = model.to_string();
    }
    if let Value::String(_) = &event.data {
        // Unparseable chunks pass through verbatim.
        return vec![ClientEvent::data_only(event.data.clone())];
    }
    let data = unwrap_code_assist(&event.data);
    let (text, tool_calls) = candidate_text(&data);
    let finish = candidate_finish_reason(&data);
    if text.is_empty() && tool_calls.is_empty() && finish.is_none() {
        return Vec::new();
    }

    let mut out: Vec<ClientEvent> = Vec::new();
    if !state.started {
        state.started = true;
        state.response_id = format!("resp_{}", uuid::Uuid::new_v4().simple());
        let created = response_envelope(state, "in_progress", Vec::new());
        let in_progress = created.clone();
        out.push(seq_event(state, "response.created", json!({"response": created})));
        out.push(seq_event(state, "response.in_progress", json!({"response": in_progress})));
    }

    if let Some(usage) = data.get("usageMetadata") {
        let prompt = usage.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
        let candidates = usage.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
        state.usage = Some(json!({"input_tokens": prompt, "output_tokens": candidates}));
    }

    if !text.is_empty() {
        if state.block_kind.get(&0) != Some(&BlockKind::Text) {
            state.block_kind.insert(0, BlockKind::Text);
            let item_id = message_item_id(state, 0);
            out.push(seq_event(
                state,
                "response.output_item.added",
                json!({
                    "output_index": 0,
                    "item": {
                        "type": "message",
                        "id": item_id,
                        "status": "in_progress",
                        "role": "assistant",
                        "content": []
                    }
                }),
            ));
            let item_id = message_item_id(state, 0);
            out.push(seq_event(
                state,
                "response.content_part.added",
                json!({
                    "item_id": item_id,
                    "output_index": 0,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": "", "annotations": []}
                }),
            ));
        }
        state.block_text.entry(0).or_default().push_str(&text);
        let item_id = message_item_id(state, 0);
        out.push(seq_event(
            state,
            "response.output_text.delta",
            json!({
                "item_id": item_id,
                "output_index": 0,
                "content_index": 0,
                "delta": text
            }),
        ));
    }

    for call in &tool_calls {
        // Function items start after the text block's output index.
        let index = 1 + state.block_fn_name.len() as u64;
        let function = call.get("function").cloned().unwrap_or(Value::Null);
        let name = function.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string();
        let arguments = function
            .get("arguments")
            .and_then(|a| a.as_str())
            .unwrap_or("{}")
            .to_string();
        let call_id = call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        state.block_kind.insert(index, BlockKind::ToolUse);
        state.block_fn_name.insert(index, name.clone());
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
        out.push(seq_event(
            state,
            "response.output_item.added",
            json!({"output_index": index, "item": item}),
        ));
        out.push(seq_event(
            state,
            "response.function_call_arguments.done",
            json!({
                "item_id": item["id"],
                "output_index": index,
                "name": name,
                "arguments": arguments
            }),
        ));
        out.push(seq_event(
            state,
            "response.output_item.done",
            json!({"output_index": index, "item": item}),
        ));
    }

    if finish.is_some() {
        if state.block_kind.get(&0) == Some(&BlockKind::Text) {
            let accumulated = state.block_text.get(&0).cloned().unwrap_or_default();
            let item_id = message_item_id(state, 0);
            let item = json!({
                "type": "message",
                "id": item_id,
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "text": accumulated, "annotations": []}]
            });
            state.finished_items.insert(0, item.clone());
            let item_id = message_item_id(state, 0);
            out.push(seq_event(
                state,
                "response.output_text.done",
                json!({
                    "item_id": item_id,
                    "output_index": 0,
                    "content_index": 0,
                    "text": accumulated
                }),
            ));
            out.push(seq_event(
                state,
                "response.content_part.done",
                json!({
                    "item_id": item["id"],
                    "output_index": 0,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": item["content"][0]["text"], "annotations": []}
                }),
            ));
            out.push(seq_event(
                state,
                "response.output_item.done",
                json!({"output_index": 0, "item": item}),
            ));
        }
        state.completed = true;
        let status = gemini_status(&data);
        let envelope = response_envelope(state, status, state.finished_items.clone());
        out.push(seq_event(state, "response.completed", json!({"response": envelope})));
    }

    out
}

fn text_parts_of(content: &Value) -> Vec<String> {
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

fn text_of(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => text_parts_of(other).join(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_and_system_map_to_gemini_shapes() {
        let body = json!({
            "model": "gpt-x",
            "max_tokens": 512,
            "messages": [
                {"role": "system", "content": "short answers"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ],
            "stop": ["END"]
        });
        let out = chat_request_to_gemini("gemini-2.5-pro", &body, false);
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(out["generationConfig"]["stopSequences"][0], "END");
    }

    #[test]
    fn tool_calls_become_function_calls() {
        let body = json!({
            "messages": [
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "c1", "type": "function",
                    "function": {"name": "get_time", "arguments": "{\"tz\":\"UTC\"}"}
                }]},
                {"role": "tool", "name": "get_time", "content": "12:00"}
            ],
            "tools": [{"type": "function", "function": {"name": "get_time", "parameters": {"type": "object"}}}]
        });
        let out = chat_request_to_gemini("gemini-2.5-pro", &body, false);
        assert_eq!(out["contents"][0]["parts"][0]["functionCall"]["name"], "get_time");
        assert_eq!(out["contents"][0]["parts"][0]["functionCall"]["args"]["tz"], "UTC");
        assert_eq!(out["contents"][1]["parts"][0]["functionResponse"]["name"], "get_time");
        assert_eq!(out["tools"][0]["functionDeclarations"][0]["name"], "get_time");
    }

    #[test]
    fn inline_image_maps_to_inline_data() {
        let body = json!({
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,QUJD"}}
            ]}]
        });
        let out = chat_request_to_gemini("gemini-2.5-pro", &body, false);
        let part = &out["contents"][0]["parts"][0]["inlineData"];
        assert_eq!(part["mimeType"], "image/jpeg");
        assert_eq!(part["data"], "QUJD");
    }

    #[test]
    fn response_maps_candidates_and_usage() {
        let upstream = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hi there"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2}
        });
        let out = gemini_response_to_chat("gemini-2.5-pro", &Value::Null, &upstream);
        assert_eq!(out["choices"][0]["message"]["content"], "hi there");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 7);
    }

    #[test]
    fn code_assist_envelope_wraps_and_unwraps() {
        let inner = json!({"contents": []});
        let wrapped = wrap_code_assist("gemini-2.5-pro", "my-project", &inner);
        assert_eq!(wrapped["project"], "my-project");
        assert_eq!(wrapped["model"], "gemini-2.5-pro");
        assert_eq!(wrapped["request"], inner);

        let nested = json!({"response": {"candidates": []}});
        assert_eq!(unwrap_code_assist(&nested), json!({"candidates": []}));
        let flat = json!({"candidates": []});
        assert_eq!(unwrap_code_assist(&flat), flat);
    }

    #[test]
    fn stream_chunks_accumulate_and_finish() {
        let mut state = StreamState::new("gemini-2.5-pro");
        let chunk = |text: &str, finish: Option<&str>| StreamEvent {
            event: None,
            data: json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": text}]},
                    "finishReason": finish
                }]
            }),
        };
        let first = gemini_stream_to_chat("gemini-2.5-pro", &Value::Null, &chunk("Hel", None), &mut state);
        assert_eq!(first[0].data["choices"][0]["delta"]["role"], "assistant");
        let second = gemini_stream_to_chat("gemini-2.5-pro", &Value::Null, &chunk("lo", Some("STOP")), &mut state);
        assert_eq!(second[0].data["choices"][0]["finish_reason"], "stop");
        assert_eq!(state.block_text.get(&0).unwrap(), "Hello");
        assert!(state.completed);
    }

    #[test]
    fn thought_only_parts_surface_as_content() {
        let data = json!({
            "candidates": [{"content": {"parts": [
                {"text": "reasoning...", "thought": true}
            ]}}]
        });
        let (text, _) = candidate_text(&data);
        assert_eq!(text, "reasoning...");
    }

    #[test]
    fn responses_request_maps_input_to_contents() {
        let body = json!({
            "model": "gpt-5",
            "instructions": "short answers",
            "max_output_tokens": 256,
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]},
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "hello"}]},
                {"type": "function_call", "call_id": "c1", "name": "lookup", "arguments": "{\"q\":1}"},
                {"type": "function_call_output", "call_id": "c1", "name": "lookup", "output": "found"}
            ],
            "tools": [{"type": "function", "name": "lookup", "parameters": {"type": "object"}}]
        });
        let out = responses_request_to_gemini("gemini-2.5-pro", &body, false);
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["contents"][2]["parts"][0]["functionCall"]["name"], "lookup");
        assert_eq!(out["contents"][2]["parts"][0]["functionCall"]["args"]["q"], 1);
        assert_eq!(out["contents"][3]["parts"][0]["functionResponse"]["name"], "lookup");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(out["tools"][0]["functionDeclarations"][0]["name"], "lookup");
    }

    #[test]
    fn responses_nonstream_response_from_gemini() {
        let upstream = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "answer"},
                    {"functionCall": {"name": "calc", "args": {"a": 1}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
        });
        let out = gemini_response_to_responses("gpt-5", &Value::Null, &upstream);
        assert_eq!(out["object"], "response");
        assert_eq!(out["status"], "completed");
        assert_eq!(out["output"][0]["content"][0]["text"], "answer");
        assert_eq!(out["output"][1]["type"], "function_call");
        assert_eq!(out["output"][1]["name"], "calc");
        assert_eq!(out["usage"]["total_tokens"], 5);
    }

    #[test]
    fn responses_stream_from_gemini_is_sequenced() {
        let mut state = StreamState::new("gpt-5");
        let chunk = |text: &str, finish: Option<&str>| StreamEvent {
            event: None,
            data: json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": text}]},
                    "finishReason": finish
                }],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2}
            }),
        };
        let mut emitted = Vec::new();
        emitted.extend(gemini_stream_to_responses("gpt-5", &Value::Null, &chunk("Hel", None), &mut state));
        emitted.extend(gemini_stream_to_responses("gpt-5", &Value::Null, &chunk("lo", Some("STOP")), &mut state));
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
        for (i, e) in emitted.iter().enumerate() {
            assert_eq!(e.data["sequence_number"], json!(i as u64));
        }
        assert_eq!(emitted[0].data["response"]["output"], json!([]));
        let text_done = emitted
            .iter()
            .find(|e| e.event.as_deref() == Some("response.output_text.done"))
            .unwrap();
        assert_eq!(text_done.data["text"], "Hello");
        let completed = emitted.last().unwrap();
        assert_eq!(completed.data["response"]["output"][0]["content"][0]["text"], "Hello");
        assert_eq!(completed.data["response"]["usage"]["total_tokens"], 6);
    }

    #[test]
    fn responses_stream_function_call_emits_done_with_name() {
        let mut state = StreamState::new("gpt-5");
        let event = StreamEvent {
            event: None,
            data: json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"functionCall": {"name": "calc", "args": {"a": 1}}}
                    ]},
                    "finishReason": "STOP"
                }]
            }),
        };
        let emitted = gemini_stream_to_responses("gpt-5", &Value::Null, &event, &mut state);
        let args_done = emitted
            .iter()
            .find(|e| e.event.as_deref() == Some("response.function_call_arguments.done"))
            .unwrap();
        assert_eq!(args_done.data["name"], "calc");
        let completed = emitted.last().unwrap();
        assert_eq!(completed.data["response"]["output"][0]["type"], "function_call");
    }
}
