// Request dispatch handlers, one per client-facing route. Each route has a
// fixed client dialect; the handler extracts the model, consults the
// manager, and proxies the (possibly streaming) response back.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::executor::ExecContext;
use crate::translator::Dialect;

use super::streaming::sse_response;
use super::AppState;

pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "polygate",
        "endpoints": [
            "POST /v1/chat/completions",
            "POST /v1/completions",
            "POST /v1/responses",
            "POST /v1/messages",
            "POST /v1/messages/count_tokens",
            "GET /v1/models",
            "GET /v1beta/models",
            "POST /v1beta/models/{model}:{action}"
        ]
    }))
}

/// Error body in the client's native error shape.
fn error_body(dialect: Dialect, status: StatusCode, message: &str, kind: &str) -> Value {
    match dialect {
        Dialect::AnthropicMessages => json!({
            "type": "error",
            "error": {"type": kind, "message": message}
        }),
        Dialect::GeminiV1Beta => json!({
            "error": {"code": status.as_u16(), "message": message, "status": kind}
        }),
        _ => json!({
            "error": {"message": message, "type": kind, "code": status.as_u16()}
        }),
    }
}

/// Maps a gateway error onto the client response. Upstream error bodies
/// pass through verbatim with their content type preserved.
fn error_response(dialect: Dialect, error: &GatewayError) -> Response {
    match error {
        GatewayError::UpstreamStatus {
            status,
            body,
            content_type,
            ..
        } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, content_type.as_str())
                .body(Body::from(body.clone()))
                .unwrap_or_else(|_| status.into_response())
        }
        GatewayError::NoEligibleCredential { dialect: d, model } => {
            let status = StatusCode::SERVICE_UNAVAILABLE;
            let body = json!({
                "error": {
                    "message": format!("no eligible credential for model {model}"),
                    "type": "no_eligible_credential",
                    "dialect": d.as_str(),
                    "model": model
                }
            });
            (status, Json(body)).into_response()
        }
        other => {
            let status = other.client_status();
            let kind = match other {
                GatewayError::BadRequest(_) => "invalid_request_error",
                GatewayError::Unauthenticated(_) => "authentication_error",
                GatewayError::Translation(_) => "translation_error",
                _ => "api_error",
            };
            (status, Json(error_body(dialect, status, &other.to_string(), kind))).into_response()
        }
    }
}

/// Forwards the raw request to the operator-configured fallback upstream,
/// relaying the response bytes unchanged.
async fn forward_to_fallback(state: &AppState, path: &str, body: &Value) -> Option<Response> {
    let config = state.manager.config();
    let base = config.fallback_upstream.trim().trim_end_matches('/').to_string();
    if base.is_empty() {
        return None;
    }
    let url = format!("{base}{path}");
    tracing::info!(url = %url, "forwarding request to fallback upstream");
    let client = crate::executor::http_client(None).ok()?;
    let response = client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .json(body)
        .send()
        .await
        .ok()?;
    let status = StatusCode::from_u16(response.status().as_u16()).ok()?;
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let stream = futures::TryStreamExt::map_err(response.bytes_stream(), std::io::Error::other);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .ok()
}

/// Whether a failed dispatch should fall back / 404 instead of 503: models
/// entirely unknown to the registry are "not found" rather than exhausted.
fn model_is_unknown(state: &AppState, model: &str) -> bool {
    state.manager.registry().lookup(model).is_empty()
}

async fn dispatch(
    state: AppState,
    dialect: Dialect,
    route: &str,
    model: String,
    is_stream: bool,
    body: Value,
) -> Response {
    let ctx = ExecContext::new();

    if is_stream {
        match state.manager.dispatch_stream(&ctx, dialect, &model, &body).await {
            Ok(rx) => sse_response(dialect, rx, ctx.cancel.clone()).into_response(),
            Err(error) => failed_dispatch(&state, dialect, route, &model, &body, error).await,
        }
    } else {
        match state.manager.dispatch(&ctx, dialect, &model, &body).await {
            Ok(value) => Json(value).into_response(),
            Err(error) => failed_dispatch(&state, dialect, route, &model, &body, error).await,
        }
    }
}

async fn failed_dispatch(
    state: &AppState,
    dialect: Dialect,
    route: &str,
    model: &str,
    body: &Value,
    error: GatewayError,
) -> Response {
    if matches!(error, GatewayError::NoEligibleCredential { .. }) {
        if let Some(response) = forward_to_fallback(state, route, body).await {
            return response;
        }
        if model_is_unknown(state, model) {
            let status = StatusCode::NOT_FOUND;
            return (
                status,
                Json(error_body(
                    dialect,
                    status,
                    &format!("model {model} not found"),
                    "not_found",
                )),
            )
                .into_response();
        }
    }
    error_response(dialect, &error)
}

fn require_model(dialect: Dialect, body: &Value) -> Result<String, Response> {
    match body.get("model").and_then(|m| m.as_str()).map(str::trim) {
        Some(model) if !model.is_empty() => Ok(model.to_string()),
        _ => {
            let status = StatusCode::BAD_REQUEST;
            Err((
                status,
                Json(error_body(dialect, status, "model is required", "invalid_request_error")),
            )
                .into_response())
        }
    }
}

pub async fn chat_completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let dialect = Dialect::OpenAiChat;
    let model = match require_model(dialect, &body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    match body.get("messages").and_then(|m| m.as_array()) {
        Some(messages) if !messages.is_empty() => {}
        _ => {
            let status = StatusCode::BAD_REQUEST;
            return (
                status,
                Json(error_body(
                    dialect,
                    status,
                    "messages must be a non-empty array",
                    "invalid_request_error",
                )),
            )
                .into_response();
        }
    }
    let is_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    dispatch(state, dialect, "/v1/chat/completions", model, is_stream, body).await
}

/// Legacy text completions: the prompt is wrapped into a single-message
/// chat request and served by the chat pipeline.
pub async fn completions(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let dialect = Dialect::OpenAiChat;
    let model = match require_model(dialect, &body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let prompt = match body.get("prompt") {
        Some(Value::String(prompt)) => prompt.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    };
    let mut wrapped = body.clone();
    if let Some(obj) = wrapped.as_object_mut() {
        obj.remove("prompt");
        obj.insert(
            "messages".into(),
            json!([{"role": "user", "content": prompt}]),
        );
    }
    let is_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    dispatch(state, dialect, "/v1/completions", model, is_stream, wrapped).await
}

pub async fn responses(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let dialect = Dialect::OpenAiResponses;
    let model = match require_model(dialect, &body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let is_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    dispatch(state, dialect, "/v1/responses", model, is_stream, body).await
}

pub async fn claude_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let dialect = Dialect::AnthropicMessages;
    let model = match require_model(dialect, &body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let is_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    dispatch(state, dialect, "/v1/messages", model, is_stream, body).await
}

pub async fn claude_count_tokens(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let dialect = Dialect::AnthropicMessages;
    let model = match require_model(dialect, &body) {
        Ok(model) => model,
        Err(response) => return response,
    };
    let ctx = ExecContext::new();
    match state.manager.count_tokens(&ctx, dialect, &model, &body).await {
        Ok(count) => Json(json!({"input_tokens": count})).into_response(),
        Err(error) => error_response(dialect, &error),
    }
}

pub async fn openai_models(State(state): State<AppState>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .manager
        .registry()
        .list_models()
        .into_iter()
        .map(|(id, owned_by)| {
            json!({"id": id, "object": "model", "created": created, "owned_by": owned_by})
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

pub async fn gemini_models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .manager
        .registry()
        .list_models()
        .into_iter()
        .filter(|(id, _)| id.starts_with("gemini"))
        .map(|(id, _)| {
            json!({
                "name": format!("models/{id}"),
                "displayName": id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent", "countTokens"]
            })
        })
        .collect();
    Json(json!({"models": models}))
}

/// Gemini routes carry the model and verb in the path:
/// `/v1beta/models/{model}:{action}`.
pub async fn gemini_handler(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let dialect = Dialect::GeminiV1Beta;
    let (model, verb) = match action.rsplit_once(':') {
        Some((model, verb)) if !model.is_empty() => (model.to_string(), verb.to_string()),
        _ => {
            let status = StatusCode::BAD_REQUEST;
            return (
                status,
                Json(error_body(
                    dialect,
                    status,
                    "expected path of the form {model}:{action}",
                    "INVALID_ARGUMENT",
                )),
            )
                .into_response();
        }
    };
    let route = format!("/v1beta/models/{action}");
    match verb.as_str() {
        "generateContent" => dispatch(state, dialect, &route, model, false, body).await,
        "streamGenerateContent" => dispatch(state, dialect, &route, model, true, body).await,
        "countTokens" => {
            let ctx = ExecContext::new();
            match state.manager.count_tokens(&ctx, dialect, &model, &body).await {
                Ok(count) => Json(json!({"totalTokens": count})).into_response(),
                Err(error) => error_response(dialect, &error),
            }
        }
        other => {
            let status = StatusCode::NOT_FOUND;
            (
                status,
                Json(error_body(
                    dialect,
                    status,
                    &format!("unsupported action: {other}"),
                    "NOT_FOUND",
                )),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_match_client_dialects() {
        let anthropic = error_body(
            Dialect::AnthropicMessages,
            StatusCode::BAD_REQUEST,
            "bad",
            "invalid_request_error",
        );
        assert_eq!(anthropic["type"], "error");
        assert_eq!(anthropic["error"]["type"], "invalid_request_error");

        let gemini = error_body(Dialect::GeminiV1Beta, StatusCode::NOT_FOUND, "missing", "NOT_FOUND");
        assert_eq!(gemini["error"]["code"], 404);

        let openai = error_body(Dialect::OpenAiChat, StatusCode::BAD_REQUEST, "bad", "invalid_request_error");
        assert_eq!(openai["error"]["code"], 400);
    }

    #[test]
    fn upstream_errors_pass_through_verbatim() {
        let error = GatewayError::upstream(
            404,
            br#"{"error":{"message":"native provider shape"}}"#.to_vec(),
            "application/json",
            None,
        );
        let response = error_response(Dialect::OpenAiChat, &error);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn no_eligible_credential_is_structured_503() {
        let error = GatewayError::NoEligibleCredential {
            dialect: Dialect::OpenAiChat,
            model: "gpt-x".into(),
        };
        let response = error_response(Dialect::OpenAiChat, &error);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
