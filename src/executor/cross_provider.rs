// Cross-provider executor: serves a client dialect on a credential that
// natively speaks Anthropic Messages (e.g. Claude on Azure AI Foundry),
// using the translated payload prepared by the selector. Adds the alias
// override and the upstream quirk fixes the target needs.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::auth::Auth;
use crate::error::{GatewayError, Result};
use crate::translator::sanitize::{lift_system_messages, sanitize_tool_names};

use super::{ClaudeExecutor, EventReceiver, ExecContext, ExecOptions, Executor};

pub struct CrossProviderExecutor {
    inner: ClaudeExecutor,
}

impl CrossProviderExecutor {
    pub fn new() -> Self {
        Self {
            inner: ClaudeExecutor::new(),
        }
    }

    fn check_credentials(auth: &Auth) -> Result<()> {
        if auth.base_url().is_none() {
            return Err(GatewayError::Unauthenticated(format!(
                "cross-provider credential {} is missing base_url",
                auth.id
            )));
        }
        if auth.api_key().is_none() {
            return Err(GatewayError::Unauthenticated(format!(
                "cross-provider credential {} is missing api_key",
                auth.id
            )));
        }
        Ok(())
    }

    /// Applies the alias override plus the post-passes Azure-hosted Claude
    /// needs: system content lifted out of messages, tool names sanitized
    /// to the target's character class.
    fn prepare_payload(auth: &Auth, payload: &Value, stream: bool) -> Value {
        let mut body = payload.clone();
        if let Some(model_name) = auth.attr("model_name") {
            if let Some(alias) = body.get("model").and_then(|m| m.as_str()) {
                tracing::debug!(alias, upstream = model_name, "cross-provider model alias resolved");
            }
            body["model"] = json!(model_name);
        }
        if stream {
            body["stream"] = json!(true);
        }
        lift_system_messages(&mut body);
        sanitize_tool_names(&mut body);
        body
    }

    fn upstream_opts(auth: &Auth, opts: &ExecOptions) -> ExecOptions {
        ExecOptions {
            model: auth.attr("model_name").unwrap_or(&opts.model).to_string(),
            dialect: opts.dialect,
        }
    }
}

impl Default for CrossProviderExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for CrossProviderExecutor {
    fn identifier(&self) -> &'static str {
        "cross-provider-claude"
    }

    async fn execute(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<Value> {
        Self::check_credentials(auth)?;
        let body = Self::prepare_payload(auth, payload, false);
        self.inner
            .execute(ctx, auth, &body, &Self::upstream_opts(auth, opts))
            .await
    }

    async fn execute_stream(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<EventReceiver> {
        Self::check_credentials(auth)?;
        let body = Self::prepare_payload(auth, payload, true);
        self.inner
            .execute_stream(ctx, auth, &body, &Self::upstream_opts(auth, opts))
            .await
    }

    async fn count_tokens(
        &self,
        ctx: &ExecContext,
        auth: &Auth,
        payload: &Value,
        opts: &ExecOptions,
    ) -> Result<u64> {
        Self::check_credentials(auth)?;
        let body = Self::prepare_payload(auth, payload, false);
        self.inner
            .count_tokens(ctx, auth, &body, &Self::upstream_opts(auth, opts))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use serde_json::json;

    fn cross_auth() -> Auth {
        let mut auth = Auth::new("cp-1".into(), "cross-provider-claude".into(), "gpt-5".into());
        auth.attributes.insert("api_key".into(), "sk-azure".into());
        auth.attributes
            .insert("base_url".into(), "https://foundry.example.com".into());
        auth.attributes.insert("model_alias".into(), "gpt-5".into());
        auth.attributes.insert("model_name".into(), "claude-opus-4-5".into());
        auth
    }

    #[test]
    fn missing_key_material_is_unauthenticated() {
        let mut auth = cross_auth();
        auth.attributes.remove("api_key");
        assert!(matches!(
            CrossProviderExecutor::check_credentials(&auth),
            Err(GatewayError::Unauthenticated(_))
        ));
        let mut auth = cross_auth();
        auth.attributes.remove("base_url");
        assert!(CrossProviderExecutor::check_credentials(&auth).is_err());
        assert!(CrossProviderExecutor::check_credentials(&cross_auth()).is_ok());
    }

    #[test]
    fn payload_gets_alias_lift_and_sanitize() {
        let auth = cross_auth();
        let payload = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ],
            "tools": [{"name": "search:web", "input_schema": {}}]
        });
        let body = CrossProviderExecutor::prepare_payload(&auth, &payload, true);
        assert_eq!(body["model"], "claude-opus-4-5");
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"][0]["text"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["name"], "search_web");
    }
}
