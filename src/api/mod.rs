// HTTP server assembly: routes, CORS, and client authentication.

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::manager::Manager;

pub mod handlers;
pub mod streaming;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
}

/// Constant-time byte comparison for client API keys.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn presented_key(request: &Request) -> Option<String> {
    let headers = request.headers();
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name == "key" && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
    })
}

/// Client authentication: a static key via header or query, compared in
/// constant time. No configured keys disables auth entirely.
async fn client_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let keys = state.manager.config().client_api_keys();
    if keys.is_empty() || request.uri().path() == "/" {
        return next.run(request).await;
    }
    let presented = presented_key(&request);
    let authorized = presented
        .as_deref()
        .map(|candidate| {
            keys.iter()
                .any(|key| constant_time_eq(key.as_bytes(), candidate.as_bytes()))
        })
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {"message": "invalid or missing api key", "type": "authentication_error"}
            })),
        )
            .into_response();
    }
    next.run(request).await
}

fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(handlers::openai_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/messages", post(handlers::claude_messages))
        .route("/v1/messages/count_tokens", post(handlers::claude_count_tokens))
        .route("/v1beta/models", get(handlers::gemini_models))
        .route("/v1beta/models/*action", post(handlers::gemini_handler))
}

/// Provider-scoped aliases for client integrations that embed the provider
/// in the path.
fn provider_routes() -> Router<AppState> {
    Router::new()
        .route("/api/provider/openai/v1/models", get(handlers::openai_models))
        .route(
            "/api/provider/openai/v1/chat/completions",
            post(handlers::chat_completions),
        )
        .route("/api/provider/openai/v1/completions", post(handlers::completions))
        .route("/api/provider/openai/v1/responses", post(handlers::responses))
        .route(
            "/api/provider/anthropic/v1/messages",
            post(handlers::claude_messages),
        )
        .route(
            "/api/provider/anthropic/v1/messages/count_tokens",
            post(handlers::claude_count_tokens),
        )
        .route("/api/provider/google/v1beta/models", get(handlers::gemini_models))
        .route(
            "/api/provider/google/v1beta/models/*action",
            post(handlers::gemini_handler),
        )
}

pub fn build_router(manager: Arc<Manager>) -> Router {
    let state = AppState { manager };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .merge(core_routes())
        .merge(provider_routes())
        .layer(middleware::from_fn_with_state(state.clone(), client_auth))
        .layer(cors)
        .with_state(state)
}
