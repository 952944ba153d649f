// Payload post-passes applied before a translated request reaches an
// Anthropic-dialect upstream. Azure AI Foundry rejects tool names outside
// [a-zA-Z0-9_-], and the Messages API requires system content at top level.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

static TOOL_NAME_INVALID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex"));

pub fn sanitize_tool_name(name: &str) -> String {
    TOOL_NAME_INVALID.replace_all(name, "_").into_owned()
}

/// Rewrites every tool/function name in the payload (tool definitions,
/// tool_use blocks, tool_choice) to the target's character class.
/// Idempotent: sanitizing twice equals sanitizing once.
pub fn sanitize_tool_names(body: &mut Value) {
    if let Some(tools) = body.get_mut("tools").and_then(|v| v.as_array_mut()) {
        for tool in tools {
            rewrite_name(tool);
        }
    }
    if let Some(messages) = body.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages {
            if let Some(content) = message.get_mut("content").and_then(|v| v.as_array_mut()) {
                for block in content {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        rewrite_name(block);
                    }
                }
            }
        }
    }
    if let Some(choice) = body.get_mut("tool_choice") {
        if choice.get("type").and_then(|t| t.as_str()) == Some("tool") {
            rewrite_name(choice);
        }
    }
}

fn rewrite_name(value: &mut Value) {
    if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
        let sanitized = sanitize_tool_name(name);
        if sanitized != name {
            value["name"] = json!(sanitized);
        }
    }
}

/// Moves any `messages[]` element with role "system" into the top-level
/// `system` array the Messages API expects. String content becomes a single
/// text part; array content keeps its text parts.
pub fn lift_system_messages(body: &mut Value) {
    let messages = match body.get("messages").and_then(|v| v.as_array()) {
        Some(messages) if !messages.is_empty() => messages.clone(),
        _ => return,
    };

    let mut system_parts: Vec<Value> = body
        .get("system")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let mut kept: Vec<Value> = Vec::with_capacity(messages.len());
    let before = system_parts.len();

    for message in messages {
        if message.get("role").and_then(|r| r.as_str()) != Some("system") {
            kept.push(message);
            continue;
        }
        match message.get("content") {
            Some(Value::String(text)) if !text.is_empty() => {
                system_parts.push(json!({"type": "text", "text": text}));
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            system_parts.push(json!({"type": "text", "text": text}));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if system_parts.len() > before {
        body["system"] = Value::Array(system_parts);
        body["messages"] = Value::Array(kept);
    } else if kept.len() != body.get("messages").and_then(|v| v.as_array()).map(|m| m.len()).unwrap_or(0) {
        // System messages with no usable text still get removed.
        body["messages"] = Value::Array(kept);
    }
}

/// Map from sanitized tool name back to the name the client declared,
/// built from the client's original request. Names that sanitize to
/// themselves are omitted.
pub fn tool_name_restore_map(original_request: &Value) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    if let Some(tools) = original_request.get("tools").and_then(|t| t.as_array()) {
        for tool in tools {
            let name = tool
                .get("name")
                .and_then(|n| n.as_str())
                .or_else(|| {
                    tool.get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                });
            if let Some(name) = name {
                let sanitized = sanitize_tool_name(name);
                if sanitized != name {
                    map.insert(sanitized, name.to_string());
                }
            }
        }
    }
    map
}

/// Rewrites sanitized tool names in a client-dialect response (or stream
/// event) back to the originals. Covers the tool-call sites of all three
/// response shapes plus their stream events.
pub fn restore_tool_names(body: &mut Value, map: &std::collections::HashMap<String, String>) {
    if map.is_empty() {
        return;
    }
    let restore = |value: &mut Value| {
        if let Some(original) = value
            .get("name")
            .and_then(|n| n.as_str())
            .and_then(|n| map.get(n))
        {
            value["name"] = json!(original);
        }
    };

    // Anthropic: content[].tool_use and stream content_block_start blocks.
    if let Some(content) = body.get_mut("content").and_then(|c| c.as_array_mut()) {
        for block in content {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                restore(block);
            }
        }
    }
    if let Some(block) = body.get_mut("content_block") {
        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
            restore(block);
        }
    }

    // OpenAI chat: message and delta tool_calls.
    if let Some(choices) = body.get_mut("choices").and_then(|c| c.as_array_mut()) {
        for choice in choices {
            for key in ["message", "delta"] {
                if let Some(calls) = choice
                    .get_mut(key)
                    .and_then(|m| m.get_mut("tool_calls"))
                    .and_then(|t| t.as_array_mut())
                {
                    for call in calls {
                        if let Some(function) = call.get_mut("function") {
                            restore(function);
                        }
                    }
                }
            }
        }
    }

    // Responses: output items, stream item payloads, and argument events.
    if let Some(output) = body.get_mut("output").and_then(|o| o.as_array_mut()) {
        for item in output {
            if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                restore(item);
            }
        }
    }
    if let Some(response) = body.get_mut("response") {
        if let Some(output) = response.get_mut("output").and_then(|o| o.as_array_mut()) {
            for item in output {
                if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                    restore(item);
                }
            }
        }
    }
    if let Some(item) = body.get_mut("item") {
        if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
            restore(item);
        }
    }
    if body.get("type").and_then(|t| t.as_str()).map(|t| t.starts_with("response.function_call")).unwrap_or(false) {
        restore(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_tool_name("search:web"), "search_web");
        assert_eq!(sanitize_tool_name("mcp.tool/run"), "mcp_tool_run");
        assert_eq!(sanitize_tool_name("already_fine-1"), "already_fine-1");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_tool_name("a:b.c/d");
        assert_eq!(sanitize_tool_name(&once), once);
    }

    #[test]
    fn sanitize_covers_tools_blocks_and_choice() {
        let mut body = serde_json::json!({
            "tools": [{"name": "search:web", "input_schema": {}}],
            "messages": [{
                "role": "assistant",
                "content": [{"type": "tool_use", "id": "t1", "name": "search:web", "input": {}}]
            }],
            "tool_choice": {"type": "tool", "name": "search:web"}
        });
        sanitize_tool_names(&mut body);
        assert_eq!(body["tools"][0]["name"], "search_web");
        assert_eq!(body["messages"][0]["content"][0]["name"], "search_web");
        assert_eq!(body["tool_choice"]["name"], "search_web");
    }

    #[test]
    fn lifts_system_messages_to_top_level() {
        let mut body = serde_json::json!({
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        });
        lift_system_messages(&mut body);
        assert_eq!(body["system"][0]["text"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn lift_appends_to_existing_system_array() {
        let mut body = serde_json::json!({
            "system": [{"type": "text", "text": "first"}],
            "messages": [
                {"role": "system", "content": [{"type": "text", "text": "second"}]},
                {"role": "user", "content": "hi"}
            ]
        });
        lift_system_messages(&mut body);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[1]["text"], "second");
    }

    #[test]
    fn restore_map_reverses_sanitization() {
        let original = serde_json::json!({
            "tools": [
                {"name": "search:web", "input_schema": {}},
                {"name": "plain_tool", "input_schema": {}}
            ]
        });
        let map = tool_name_restore_map(&original);
        assert_eq!(map.get("search_web").map(String::as_str), Some("search:web"));
        assert!(!map.contains_key("plain_tool"));

        let mut response = serde_json::json!({
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "t1", "name": "search_web", "input": {}}
            ]
        });
        restore_tool_names(&mut response, &map);
        assert_eq!(response["content"][1]["name"], "search:web");
    }

    #[test]
    fn restore_covers_chat_tool_calls() {
        let original = serde_json::json!({
            "tools": [{"type": "function", "function": {"name": "a.b", "parameters": {}}}]
        });
        let map = tool_name_restore_map(&original);
        let mut response = serde_json::json!({
            "choices": [{"message": {"tool_calls": [{"function": {"name": "a_b", "arguments": "{}"}}]}}]
        });
        restore_tool_names(&mut response, &map);
        assert_eq!(response["choices"][0]["message"]["tool_calls"][0]["function"]["name"], "a.b");
    }

    #[test]
    fn lift_without_system_messages_is_noop() {
        let mut body = serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}]
        });
        let before = body.clone();
        lift_system_messages(&mut body);
        assert_eq!(body, before);
    }
}
