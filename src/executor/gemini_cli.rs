// Gemini OAuth executor against the Cloud Code Assist endpoint. Payloads
// travel inside the Code Assist envelope; tokens refresh through the
// shared per-file runtime so virtual project credentials never race.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::auth::{Auth, TokenState};
use crate::error::{GatewayError, Result};
use crate::translator::gemini::{unwrap_code_assist, wrap_code_assist};

use super::{
    apply_custom_headers, error_from_response, http_client, spawn_event_reader, usage_of,
    EventReceiver, ExecContext, ExecOptions, Executor, UsageReporter,
};

const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
const CODE_ASSIST_VERSION: &str = "v1internal";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const DEFAULT_CLIENT_SECRET: &str = "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";
const REFRESH_MARGIN_SECS: i64 = 120;

pub struct GeminiCliExecutor;

impl GeminiCliExecutor {
    pub fn new() -> Self {
        Self
    }

    fn project_of(auth: &Auth) -> String {
        auth.attr("gemini_virtual_project")
            .map(String::from)
            .or_else(|| {
                auth.metadata
                    .get("project_id")
                    .and_then(|v| v.as_str())
                    .map(|p| p.split(',').next().unwrap_or("").trim().to_string())
            })
            .unwrap_or_default()
    }

    async fn request(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        action: &str,
        payload: &Value,
        opts: &ExecOptions,
        accept_sse: bool,
    ) -> Result<reqwest::Response> {
        self.refresh(ctx, auth).await?;

        let token = auth
            .runtime
            .as_ref()
            .map(|runtime| runtime.token.read().access_token.clone())
            .unwrap_or_default();
        if token.is_empty() {
            return Err(GatewayError::Unauthenticated(format!(
                "credential {} has no access token",
                auth.id
            )));
        }

        let envelope = wrap_code_assist(&opts.model, &Self::project_of(auth), payload);
        let mut url = format!("{CODE_ASSIST_ENDPOINT}/{CODE_ASSIST_VERSION}:{action}");
        if accept_sse {
            url.push_str("?alt=sse");
        }
        let client = http_client(auth.proxy_url.as_deref())?;
        let mut builder = client
            .post(&url)
            .bearer_auth(token)
            .header("content-type", "application/json")
            .header("user-agent", "google-api-nodejs-client/9.15.1")
            .header("x-goog-api-client", "gl-node/22.17.0")
            .header(
                "client-metadata",
                "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI",
            );
        if accept_sse {
            builder = builder.header("accept", "text/event-stream");
        } else {
            builder = builder.header("accept", "application/json");
        }
        builder = apply_custom_headers(builder, auth);

        let send = builder.json(&envelope).send();
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

impl Default for GeminiCliExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for GeminiCliExecutor {
    fn identifier(&self) -> &'static str {
        "gemini-cli"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<Value> {
        let mut reporter = UsageReporter::new(self.identifier(), &opts.model, auth);
        let response = self
            .request(ctx, auth, "generateContent", payload, opts, false)
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Translation(format!("invalid upstream json: {e}")))?;
        if let Some(usage) = usage_of(&body) {
            reporter.publish(&usage);
        }
        reporter.ensure_published();
        Ok(unwrap_code_assist(&body))
    }

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<EventReceiver> {
        let reporter = UsageReporter::new(self.identifier(), &opts.model, auth);
        let response = self
            .request(ctx, auth, "streamGenerateContent", payload, opts, true)
            .await?;
        let upstream = spawn_event_reader(response, ctx.cancel.clone());
        let mut upstream = super::attach_usage_reporter(upstream, reporter);
        // Chunks arrive wrapped in the Code Assist envelope; peel it so
        // consumers see plain Gemini payloads.
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(event) = upstream.recv().await {
                let mapped = event.map(|e| crate::translator::StreamEvent {
                    event: e.event,
                    data: unwrap_code_assist(&e.data),
                });
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn count_tokens(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<u64> {
        let body = json!({
            "contents": payload.get("contents").cloned().unwrap_or_else(|| json!([]))
        });
        let response = self
            .request(ctx, auth, "countTokens", &body, opts, false)
            .await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Translation(format!("invalid count response: {e}")))?;
        let parsed = unwrap_code_assist(&parsed);
        Ok(parsed
            .get("totalTokens")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| super::estimate_tokens(payload)))
    }

    async fn refresh(&self, _ctx: &ExecContext, auth: &Auth) -> Result<()> {
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

        let client_id = std::env::var("GEMINI_OAUTH_CLIENT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        let client_secret = std::env::var("GEMINI_OAUTH_CLIENT_SECRET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_SECRET.to_string());

        tracing::debug!(auth = %auth.id, "refreshing gemini oauth token");
        let client = http_client(auth.proxy_url.as_deref())?;
        let response = client
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
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
