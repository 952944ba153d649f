// Credential selection and dispatch. Picks an eligible credential for a
// (dialect, model) pair, runs the executor with request/response
// translation around it, and handles retry, cooldown and failover.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::auth::{Auth, AuthStatus, AuthStore};
use crate::config::AppConfig;
use crate::error::{GatewayError, Result};
use crate::executor::{executor_for, provider_dialects, ExecContext, ExecOptions};
use crate::registry::{resolve_upstream_model, ModelRegistry};
use crate::translator::{self, ClientEvent, Converter, Dialect, StreamState};

const DEFAULT_COOLDOWN_SECS: i64 = 60;
const TRANSIENT_COOLDOWN_SECS: i64 = 30;
/// Consecutive 5xx/network failures a credential absorbs before cooling.
const TRANSIENT_FAILURE_BUDGET: u32 = 3;

pub type ClientEventReceiver = mpsc::Receiver<Result<ClientEvent>>;

pub struct Manager {
    store: Arc<AuthStore>,
    registry: Arc<ModelRegistry>,
    config: RwLock<Arc<AppConfig>>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl Manager {
    pub fn new(store: Arc<AuthStore>, registry: Arc<ModelRegistry>, config: Arc<AppConfig>) -> Self {
        crate::executor::set_default_proxy(&config.proxy_url);
        Self {
            store,
            registry,
            config: RwLock::new(config),
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_config(&self, config: Arc<AppConfig>) {
        crate::executor::set_default_proxy(&config.proxy_url);
        *self.config.write() = config;
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.read().clone()
    }

    pub fn store(&self) -> &Arc<AuthStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The provider-side dialect used for a credential serving `client`.
    fn provider_dialect(auth: &Auth, client: Dialect) -> Dialect {
        let dialects = provider_dialects(&auth.provider);
        if dialects.contains(&client) {
            client
        } else {
            dialects[0]
        }
    }

    fn converter(auth: &Auth, client: Dialect) -> Option<(&'static Converter, Dialect)> {
        let provider = Self::provider_dialect(auth, client);
        translator::lookup(client, provider).map(|conv| (conv, provider))
    }

    /// Eligible credentials for (dialect, model), round-robin rotated with
    /// lexicographic id order underneath for determinism.
    pub fn eligible_credentials(&self, dialect: Dialect, model: &str) -> Vec<Arc<Auth>> {
        let ids = self.registry.lookup(model);
        if ids.is_empty() {
            return Vec::new();
        }
        let snapshot = self.store.snapshot();
        let mut eligible: Vec<Arc<Auth>> = ids
            .iter()
            .filter_map(|id| snapshot.get(id).cloned())
            .filter(|auth| auth.status() == AuthStatus::Active)
            .filter(|auth| Self::converter(auth, dialect).is_some())
            .collect();
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        if eligible.len() > 1 {
            let key = format!("{dialect}:{}", crate::registry::canonical_model(model));
            let mut counters = self.round_robin.lock();
            let counter = counters.entry(key).or_insert(0);
            let offset = *counter % eligible.len();
            *counter = counter.wrapping_add(1);
            eligible.rotate_left(offset);
        }
        eligible
    }

    fn on_success(&self, auth: &Auth) {
        let mut state = auth.state.lock();
        state.last_used_at = Some(Utc::now());
        state.transient_failures = 0;
    }

    /// Applies the outcome table to the credential after a failed attempt.
    fn on_failure(&self, auth: &Auth, error: &GatewayError) {
        let max_retry_interval = self.config().max_retry_interval as i64;
        let mut state = auth.state.lock();
        match error {
            GatewayError::UpstreamStatus { status: 401 | 403, .. } | GatewayError::Unauthenticated(_) => {
                state.status = AuthStatus::Disabled;
                tracing::warn!(auth = %auth.id, "credential disabled after authorization failure");
            }
            GatewayError::UpstreamStatus {
                status: 429,
                retry_after,
                ..
            } => {
                let backoff = retry_after
                    .map(|secs| secs as i64)
                    .filter(|secs| *secs > 0 && *secs <= max_retry_interval.max(1))
                    .unwrap_or(DEFAULT_COOLDOWN_SECS);
                state.status = AuthStatus::Cooling;
                state.cooldown_until = Some(Utc::now() + ChronoDuration::seconds(backoff));
                tracing::info!(auth = %auth.id, backoff_secs = backoff, "credential cooling after quota signal");
            }
            GatewayError::UpstreamStatus { status, .. } if *status >= 500 => {
                state.transient_failures += 1;
                if state.transient_failures >= TRANSIENT_FAILURE_BUDGET {
                    state.status = AuthStatus::Cooling;
                    state.cooldown_until =
                        Some(Utc::now() + ChronoDuration::seconds(TRANSIENT_COOLDOWN_SECS));
                    state.transient_failures = 0;
                    tracing::info!(auth = %auth.id, "credential cooling after repeated upstream errors");
                }
            }
            GatewayError::Network(_) => {
                state.transient_failures += 1;
                if state.transient_failures >= TRANSIENT_FAILURE_BUDGET {
                    state.status = AuthStatus::Cooling;
                    state.cooldown_until =
                        Some(Utc::now() + ChronoDuration::seconds(TRANSIENT_COOLDOWN_SECS));
                    state.transient_failures = 0;
                }
            }
            // Client cancellation and non-retryable errors leave state alone.
            _ => {}
        }
    }

    fn keep_most_informative(current: Option<GatewayError>, candidate: GatewayError) -> Option<GatewayError> {
        match (&current, &candidate) {
            (None, _) => Some(candidate),
            (Some(GatewayError::UpstreamStatus { .. }), GatewayError::UpstreamStatus { .. }) => Some(candidate),
            (Some(GatewayError::UpstreamStatus { .. }), _) => current,
            _ => Some(candidate),
        }
    }

    /// Non-streaming dispatch with failover. Returns the response already
    /// translated into the client dialect.
    pub async fn dispatch(
        &self,
        ctx: &ExecContext,
        dialect: Dialect,
        model: &str,
        body: &Value,
    ) -> Result<Value> {
        let eligible = self.eligible_credentials(dialect, model);
        if eligible.is_empty() {
            return Err(GatewayError::NoEligibleCredential {
                dialect,
                model: model.to_string(),
            });
        }
        let attempts = self.config().request_retry.max(1) as usize;
        let mut last_error: Option<GatewayError> = None;

        for (attempt, auth) in eligible.iter().take(attempts).enumerate() {
            let started = Instant::now();
            tracing::info!(
                request = %ctx.request_id,
                dialect = %dialect,
                model,
                auth = %auth.id,
                attempt,
                "dispatch start"
            );
            match self.attempt(ctx, dialect, model, body, auth, false).await {
                Ok(AttemptOutcome::Response(value)) => {
                    self.on_success(auth);
                    tracing::info!(
                        request = %ctx.request_id,
                        auth = %auth.id,
                        latency_ms = started.elapsed().as_millis() as u64,
                        status = 200u16,
                        "dispatch complete"
                    );
                    return Ok(value);
                }
                Ok(AttemptOutcome::Stream(_)) => unreachable!("non-streaming attempt"),
                Err(error) => {
                    self.on_failure(auth, &error);
                    tracing::warn!(
                        request = %ctx.request_id,
                        auth = %auth.id,
                        latency_ms = started.elapsed().as_millis() as u64,
                        error = %error,
                        "dispatch attempt failed"
                    );
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    last_error = Self::keep_most_informative(last_error, error);
                }
            }
        }
        Err(last_error.unwrap_or(GatewayError::NoEligibleCredential {
            dialect,
            model: model.to_string(),
        }))
    }

    /// Streaming dispatch. Failover only happens before the first byte:
    /// once a stream is open, upstream errors surface as a partial stream.
    pub async fn dispatch_stream(
        &self,
        ctx: &ExecContext,
        dialect: Dialect,
        model: &str,
        body: &Value,
    ) -> Result<ClientEventReceiver> {
        let eligible = self.eligible_credentials(dialect, model);
        if eligible.is_empty() {
            return Err(GatewayError::NoEligibleCredential {
                dialect,
                model: model.to_string(),
            });
        }
        let attempts = self.config().request_retry.max(1) as usize;
        let mut last_error: Option<GatewayError> = None;

        for (attempt, auth) in eligible.iter().take(attempts).enumerate() {
            tracing::info!(
                request = %ctx.request_id,
                dialect = %dialect,
                model,
                auth = %auth.id,
                attempt,
                stream = true,
                "dispatch start"
            );
            match self.attempt(ctx, dialect, model, body, auth, true).await {
                Ok(AttemptOutcome::Stream(rx)) => {
                    self.on_success(auth);
                    return Ok(rx);
                }
                Ok(AttemptOutcome::Response(_)) => unreachable!("streaming attempt"),
                Err(error) => {
                    self.on_failure(auth, &error);
                    tracing::warn!(
                        request = %ctx.request_id,
                        auth = %auth.id,
                        error = %error,
                        "stream dispatch attempt failed"
                    );
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    last_error = Self::keep_most_informative(last_error, error);
                }
            }
        }
        Err(last_error.unwrap_or(GatewayError::NoEligibleCredential {
            dialect,
            model: model.to_string(),
        }))
    }

    async fn attempt(
        &self,
        ctx: &ExecContext,
        dialect: Dialect,
        model: &str,
        body: &Value,
        auth: &Arc<Auth>,
        stream: bool,
    ) -> Result<AttemptOutcome> {
        let (conv, provider_dialect) = Self::converter(auth, dialect)
            .ok_or_else(|| GatewayError::Translation(format!(
                "no converter from {dialect} for provider {}",
                auth.provider
            )))?;
        let upstream_model = resolve_upstream_model(auth, model);
        let payload = (conv.request)(&upstream_model, body, stream);
        let executor = executor_for(&auth.provider);
        let opts = ExecOptions {
            model: upstream_model.clone(),
            dialect: provider_dialect,
        };

        // Cross-provider upstreams see sanitized tool names; responses get
        // the client's original names restored.
        let restore_map = if auth.provider.starts_with("cross-provider") {
            crate::translator::sanitize::tool_name_restore_map(body)
        } else {
            Default::default()
        };

        if !stream {
            let upstream = executor.execute(ctx, auth, &payload, &opts).await?;
            let mut translated = (conv.response)(model, body, &upstream);
            crate::translator::sanitize::restore_tool_names(&mut translated, &restore_map);
            return Ok(AttemptOutcome::Response(translated));
        }

        let mut upstream_rx = executor.execute_stream(ctx, auth, &payload, &opts).await?;
        let (tx, rx) = mpsc::channel::<Result<ClientEvent>>(1);
        let model = model.to_string();
        let original = body.clone();
        let conv = *conv;
        tokio::spawn(async move {
            let mut state = StreamState::new(&model);
            let mut failed = false;
            while let Some(event) = upstream_rx.recv().await {
                match event {
                    Ok(event) => {
                        for mut client_event in (conv.stream)(&model, &original, &event, &mut state) {
                            crate::translator::sanitize::restore_tool_names(
                                &mut client_event.data,
                                &restore_map,
                            );
                            if tx.send(Ok(client_event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        failed = true;
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                }
            }
            if !failed {
                for client_event in (conv.flush)(&model, &mut state) {
                    if tx.send(Ok(client_event)).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(AttemptOutcome::Stream(rx))
    }

    /// Token counting for the client dialect, using the first eligible
    /// credential's provider endpoint where one exists.
    pub async fn count_tokens(
        &self,
        ctx: &ExecContext,
        dialect: Dialect,
        model: &str,
        body: &Value,
    ) -> Result<u64> {
        let eligible = self.eligible_credentials(dialect, model);
        let auth = eligible.first().ok_or_else(|| GatewayError::NoEligibleCredential {
            dialect,
            model: model.to_string(),
        })?;
        let (conv, provider_dialect) = Self::converter(auth, dialect).ok_or_else(|| {
            GatewayError::Translation(format!("no converter for provider {}", auth.provider))
        })?;
        let upstream_model = resolve_upstream_model(auth, model);
        let payload = (conv.request)(&upstream_model, body, false);
        let executor = executor_for(&auth.provider);
        let opts = ExecOptions {
            model: upstream_model,
            dialect: provider_dialect,
        };
        executor.count_tokens(ctx, auth, &payload, &opts).await
    }

    /// Background timer that re-activates cooling credentials once their
    /// cooldown expires. No active probing.
    pub fn spawn_cooldown_recovery(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let snapshot = manager.store.snapshot();
                let now = Utc::now();
                for auth in snapshot.values() {
                    let mut state = auth.state.lock();
                    if state.status == AuthStatus::Cooling
                        && state.cooldown_until.map(|until| until <= now).unwrap_or(true)
                    {
                        state.status = AuthStatus::Active;
                        state.cooldown_until = None;
                        tracing::info!(auth = %auth.id, "credential recovered from cooldown");
                    }
                }
            }
        })
    }
}

enum AttemptOutcome {
    Response(Value),
    Stream(ClientEventReceiver),
}
