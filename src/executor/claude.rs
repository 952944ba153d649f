// Anthropic Messages executor. Serves API-key credentials (config) and
// OAuth token files; cross-provider credentials reuse this executor via
// the wrapper.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::auth::{Auth, TokenState};
use crate::error::{GatewayError, Result};

use super::{
    apply_custom_headers, error_from_response, http_client, spawn_event_reader, usage_of,
    EventReceiver, ExecContext, ExecOptions, Executor, UsageReporter,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
/// Refresh tokens this close to expiry.
const REFRESH_MARGIN_SECS: i64 = 120;

pub struct ClaudeExecutor;

impl ClaudeExecutor {
    pub fn new() -> Self {
        Self
    }

    fn base_url(auth: &Auth) -> String {
        auth.base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string()
    }

    fn bearer_token(auth: &Auth) -> Option<String> {
        let runtime = auth.runtime.as_ref()?;
        let token = runtime.token.read();
        if token.access_token.is_empty() {
            None
        } else {
            Some(token.access_token.clone())
        }
    }

    async fn request(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        path: &str,
        payload: &Value,
        accept_sse: bool,
    ) -> Result<reqwest::Response> {
        self.refresh(ctx, auth).await?;

        let url = format!("{}{}", Self::base_url(auth), path);
        let client = http_client(auth.proxy_url.as_deref())?;
        let mut builder = client
            .post(&url)
            .header("content-type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = auth.api_key() {
            builder = builder.header("x-api-key", key);
        } else if let Some(token) = Self::bearer_token(auth) {
            builder = builder.bearer_auth(token);
        } else {
            return Err(GatewayError::Unauthenticated(format!(
                "credential {} has neither api_key nor access token",
                auth.id
            )));
        }
        if accept_sse {
            builder = builder.header("accept", "text/event-stream");
        }
        builder = apply_custom_headers(builder, auth);

        let send = builder.json(payload).send();
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(GatewayError::ClientCancelled),
            response = send => response?,
        };
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        "claude"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<Value> {
        let mut reporter = UsageReporter::new(self.identifier(), &opts.model, auth);
        let response = self.request(ctx, auth, "/v1/messages", payload, false).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Translation(format!("invalid upstream json: {e}")))?;
        if let Some(usage) = usage_of(&body) {
            reporter.publish(&usage);
        }
        reporter.ensure_published();
        Ok(body)
    }

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<EventReceiver> {
        let reporter = UsageReporter::new(self.identifier(), &opts.model, auth);
        let response = self.request(ctx, auth, "/v1/messages", payload, true).await?;
        let rx = spawn_event_reader(response, ctx.cancel.clone());
        Ok(super::attach_usage_reporter(rx, reporter))
    }

    async fn count_tokens(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        _opts: &ExecOptions,
    ) -> Result<u64> {
        // The counting endpoint rejects fields the Messages endpoint accepts.
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.remove("stream");
            obj.remove("max_tokens");
            obj.remove("metadata");
        }
        let response = self
            .request(ctx, auth, "/v1/messages/count_tokens", &body, false)
            .await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Translation(format!("invalid count response: {e}")))?;
        Ok(parsed
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| super::estimate_tokens(payload)))
    }

    async fn refresh(&self, _ctx: &ExecContext, auth: &Auth) -> Result<()> {
        // API-key credentials never refresh.
        if auth.api_key().is_some() {
            return Ok(());
        }
        let runtime = match &auth.runtime {
            Some(runtime) => runtime.clone(),
            None => return Ok(()),
        };
        let needs_refresh = {
            let token = runtime.token.read();
            !token.refresh_token.is_empty()
                && token
                    .expiry
                    .map(|expiry| expiry - Duration::seconds(REFRESH_MARGIN_SECS) <= Utc::now())
                    .unwrap_or(token.access_token.is_empty())
        };
        if !needs_refresh {
            return Ok(());
        }

        // Serialize refreshes per credential; re-check under the lock.
        let _guard = runtime.refresh_lock.lock().await;
        let refresh_token = {
            let token = runtime.token.read();
            if token
                .expiry
                .map(|expiry| expiry - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now())
                .unwrap_or(false)
            {
                return Ok(());
            }
            token.refresh_token.clone()
        };
        if refresh_token.is_empty() {
            return Ok(());
        }

        tracing::debug!(auth = %auth.id, "refreshing anthropic oauth token");
        let client = http_client(auth.proxy_url.as_deref())?;
        let response = client
            .post(OAUTH_TOKEN_URL)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": OAUTH_CLIENT_ID,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Network(format!("invalid token response: {e}")))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if access_token.is_empty() {
            return Err(GatewayError::Unauthenticated(format!(
                "token refresh for {} returned no access token",
                auth.id
            )));
        }
        let new_refresh = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or(refresh_token);
        let expiry = body
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .map(|secs| Utc::now() + Duration::seconds(secs));
        *runtime.token.write() = TokenState {
            access_token: access_token.clone(),
            refresh_token: new_refresh.clone(),
            expiry,
        };
        super::persist_token(auth, &access_token, &new_refresh, expiry);
        Ok(())
    }
}
