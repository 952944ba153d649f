// Gemini v1beta executor for API-key credentials against the public
// generativelanguage endpoint.

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Auth;
use crate::error::{GatewayError, Result};

use super::{
    apply_custom_headers, error_from_response, http_client, spawn_event_reader, usage_of,
    EventReceiver, ExecContext, ExecOptions, Executor, UsageReporter,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiExecutor;

impl GeminiExecutor {
    pub fn new() -> Self {
        Self
    }

    fn url(auth: &Auth, model: &str, action: &str) -> String {
        let base = auth
            .base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        format!("{base}/v1beta/models/{model}:{action}")
    }

    async fn request(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        url: &str,
        payload: &Value,
        accept_sse: bool,
    ) -> Result<reqwest::Response> {
        let key = auth.api_key().ok_or_else(|| {
            GatewayError::Unauthenticated(format!("credential {} has no api_key", auth.id))
        })?;
        let client = http_client(auth.proxy_url.as_deref())?;
        let mut builder = client
            .post(url)
            .header("content-type", "application/json")
            .header("x-goog-api-key", key);
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

impl Default for GeminiExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        "gemini"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<Value> {
        let mut reporter = UsageReporter::new(self.identifier(), &opts.model, auth);
        let url = Self::url(auth, &opts.model, "generateContent");
        let response = self.request(ctx, auth, &url, payload, false).await?;
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
        let url = format!("{}?alt=sse", Self::url(auth, &opts.model, "streamGenerateContent"));
        let response = self.request(ctx, auth, &url, payload, true).await?;
        let rx = spawn_event_reader(response, ctx.cancel.clone());
        Ok(super::attach_usage_reporter(rx, reporter))
    }

    async fn count_tokens(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<u64> {
        // countTokens only accepts contents.
        let body = serde_json::json!({
            "contents": payload.get("contents").cloned().unwrap_or_else(|| serde_json::json!([]))
        });
        let url = Self::url(auth, &opts.model, "countTokens");
        let response = self.request(ctx, auth, &url, &body, false).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Translation(format!("invalid count response: {e}")))?;
        Ok(parsed
            .get("totalTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| super::estimate_tokens(payload)))
    }
}
