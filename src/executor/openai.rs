// OpenAI-compatible executor: Chat Completions and Responses paths on any
// base URL. Serves codex API keys and every openai-compatibility provider.

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Auth;
use crate::error::{GatewayError, Result};
use crate::translator::Dialect;

use super::{
    apply_custom_headers, error_from_response, http_client, spawn_event_reader, usage_of,
    EventReceiver, ExecContext, ExecOptions, Executor, UsageReporter,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiExecutor;

impl OpenAiExecutor {
    pub fn new() -> Self {
        Self
    }

    fn endpoint(auth: &Auth, dialect: Dialect) -> String {
        let base = auth
            .base_url()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let path = match dialect {
            Dialect::OpenAiResponses => "/responses",
            _ => "/chat/completions",
        };
        format!("{base}{path}")
    }

    async fn request(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
        accept_sse: bool,
    ) -> Result<reqwest::Response> {
        let url = Self::endpoint(auth, opts.dialect);
        let client = http_client(auth.proxy_url.as_deref())?;
        let mut builder = client.post(&url).header("content-type", "application/json");
        if let Some(key) = auth.api_key() {
            builder = builder.bearer_auth(key);
        } else if let Some(runtime) = &auth.runtime {
            let token = runtime.token.read().access_token.clone();
            if token.is_empty() {
                return Err(GatewayError::Unauthenticated(format!(
                    "credential {} has no usable key material",
                    auth.id
                )));
            }
            builder = builder.bearer_auth(token);
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

impl Default for OpenAiExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for OpenAiExecutor {
    fn identifier(&self) -> &'static str {
        "openai-compat"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<Value> {
        let mut reporter = UsageReporter::new(self.identifier(), &opts.model, auth);
        let response = self.request(ctx, auth, payload, opts, false).await?;
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
        let response = self.request(ctx, auth, payload, opts, true).await?;
        let rx = spawn_event_reader(response, ctx.cancel.clone());
        Ok(super::attach_usage_reporter(rx, reporter))
    }
}
