// Model registry: client-facing model names mapped to the credential ids
// that can serve them. Rebuilt by the reconciler, swapped atomically.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::auth::synthesize::models_from_attr;
use crate::auth::Auth;

/// Published catalogue per provider family, used for credentials that do
/// not declare an explicit model list.
pub fn provider_catalogue(provider: &str) -> &'static [&'static str] {
    match provider {
        "claude" => &[
            "claude-opus-4-5-20251101",
            "claude-sonnet-4-5-20250929",
            "claude-haiku-4-5-20251001",
            "claude-opus-4-20250514",
            "claude-sonnet-4-20250514",
            "claude-3-7-sonnet-20250219",
            "claude-3-5-haiku-20241022",
        ],
        "gemini" | "gemini-cli" => &[
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-3-pro-preview",
            "gemini-3-flash-preview",
        ],
        "codex" => &[
            "gpt-5",
            "gpt-5-codex",
            "gpt-5-mini",
            "gpt-5.1",
            "gpt-5.1-codex",
            "gpt-4o",
            "o3",
            "o4-mini",
        ],
        _ => &[],
    }
}

fn owned_by(provider: &str) -> &'static str {
    match provider {
        "claude" | "cross-provider-claude" => "anthropic",
        "gemini" | "gemini-cli" => "google",
        "codex" => "openai",
        _ => "organization",
    }
}

/// Case-insensitive, trimmed model key. Gemini "thinking" variants resolve
/// to their base model.
pub fn canonical_model(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    match lowered.strip_suffix("-thinking") {
        Some(base) if base.starts_with("gemini") => base.to_string(),
        _ => lowered,
    }
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// canonical model name → credential ids.
    models: HashMap<String, BTreeSet<String>>,
    /// display name → owning provider family, for enumeration endpoints.
    display: BTreeMap<String, &'static str>,
}

impl RegistrySnapshot {
    fn insert(&mut self, model: &str, auth: &Auth) {
        let model = model.trim();
        if model.is_empty() {
            return;
        }
        self.models
            .entry(canonical_model(model))
            .or_default()
            .insert(auth.id.clone());
        self.display.entry(model.to_string()).or_insert(owned_by(&auth.provider));
    }
}

#[derive(Default)]
pub struct ModelRegistry {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the model set for each credential and swaps the snapshot.
    /// Disabled credentials (virtual primaries) contribute nothing.
    pub fn rebuild<'a, I>(&self, auths: I)
    where
        I: IntoIterator<Item = &'a Arc<Auth>>,
    {
        let mut snapshot = RegistrySnapshot::default();
        for auth in auths {
            if auth.disabled {
                continue;
            }
            if let Some(alias) = auth.attr("model_alias") {
                // Cross-provider credentials serve exactly their alias.
                snapshot.insert(alias, auth);
                continue;
            }
            if let Some(models) = auth.attr("models") {
                for entry in models_from_attr(models) {
                    snapshot.insert(&entry.name, auth);
                    snapshot.insert(&entry.alias, auth);
                }
                continue;
            }
            for model in provider_catalogue(&auth.provider) {
                snapshot.insert(model, auth);
            }
        }
        *self.inner.write() = Arc::new(snapshot);
    }

    /// Credential ids serving `model`. Unknown models yield an empty set.
    pub fn lookup(&self, model: &str) -> BTreeSet<String> {
        let snapshot = self.inner.read().clone();
        snapshot
            .models
            .get(&canonical_model(model))
            .cloned()
            .unwrap_or_default()
    }

    /// Display names with their provider family, sorted, for /v1/models.
    pub fn list_models(&self) -> Vec<(String, &'static str)> {
        let snapshot = self.inner.read().clone();
        snapshot
            .display
            .iter()
            .map(|(name, family)| (name.clone(), *family))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().models.is_empty()
    }
}

/// Resolves the model name actually sent upstream for a credential:
/// cross-provider credentials use their declared `model_name`; credentials
/// with a model list map alias → name (case-insensitive, trimmed);
/// everything else passes the requested name through.
pub fn resolve_upstream_model(auth: &Auth, requested: &str) -> String {
    if let Some(alias) = auth.attr("model_alias") {
        if alias.trim().eq_ignore_ascii_case(requested.trim()) {
            if let Some(name) = auth.attr("model_name") {
                return name.to_string();
            }
        }
    }
    if let Some(models) = auth.attr("models") {
        let canonical = canonical_model(requested);
        for entry in models_from_attr(models) {
            if canonical_model(&entry.alias) == canonical && !entry.name.trim().is_empty() {
                return entry.name.trim().to_string();
            }
        }
    }
    requested.trim().to_string()
}
