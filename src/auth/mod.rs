// Credential model. A credential ("auth") is the routable unit: one way to
// call one provider, whether synthesized from config or read from a token
// file in the auth directory.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod store;
pub mod synthesize;

pub use store::{AuthStore, AuthUpdate};

/// Lifecycle status of a credential with respect to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Active,
    Cooling,
    Disabled,
    Exhausted,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Active => "active",
            AuthStatus::Cooling => "cooling",
            AuthStatus::Disabled => "disabled",
            AuthStatus::Exhausted => "exhausted",
        }
    }
}

/// Mutable per-credential dispatch state, guarded by its own mutex so
/// status transitions are serialized per credential id.
#[derive(Debug, Clone)]
pub struct DispatchState {
    pub status: AuthStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub transient_failures: u32,
}

impl Default for DispatchState {
    fn default() -> Self {
        Self {
            status: AuthStatus::Active,
            cooldown_until: None,
            last_used_at: None,
            transient_failures: 0,
        }
    }
}

/// Shared token-refresh runtime for Gemini OAuth credentials. Virtual
/// per-project children hold an `Arc` to the same runtime as their parent
/// so one refresh serves every project.
#[derive(Debug, Default)]
pub struct SharedTokenRuntime {
    /// Serializes refresh RPCs so concurrent dispatches do not storm the
    /// token endpoint.
    pub refresh_lock: tokio::sync::Mutex<()>,
    pub token: parking_lot::RwLock<TokenState>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

/// One credential. Descriptor fields are immutable after synthesis; the
/// reconciler replaces the whole record on change. Only `state` mutates in
/// place, and only through the manager.
#[derive(Debug)]
pub struct Auth {
    pub id: String,
    /// Provider tag: `gemini`, `gemini-cli`, `claude`, `codex`,
    /// `cross-provider-claude`, or an openai-compatibility provider name.
    pub provider: String,
    pub label: String,
    pub attributes: BTreeMap<String, String>,
    /// Opaque file contents for file-backed credentials (everything beyond
    /// `type` is handed to the executor untouched).
    pub metadata: Value,
    pub proxy_url: Option<String>,
    /// Marked by synthesis: primaries of virtual Gemini credentials are
    /// disabled so only their children are routable.
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub runtime: Option<Arc<SharedTokenRuntime>>,
    pub state: Mutex<DispatchState>,
}

impl Auth {
    pub fn new(id: String, provider: String, label: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider,
            label,
            attributes: BTreeMap::new(),
            metadata: Value::Null,
            proxy_url: None,
            disabled: false,
            created_at: now,
            updated_at: now,
            runtime: None,
            state: Mutex::new(DispatchState::default()),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|v| v.as_str()).filter(|v| !v.trim().is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.attr("api_key")
    }

    pub fn base_url(&self) -> Option<&str> {
        self.attr("base_url")
    }

    /// Custom headers declared as `header:<Name>` attributes.
    pub fn custom_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(k, v)| {
            let name = k.strip_prefix("header:")?;
            if name.trim().is_empty() || v.trim().is_empty() {
                return None;
            }
            Some((name, v.as_str()))
        })
    }

    pub fn status(&self) -> AuthStatus {
        if self.disabled {
            return AuthStatus::Disabled;
        }
        self.state.lock().status
    }

    /// Equality used by the reconciler: ignores timestamps, runtime and
    /// dispatch state so token refreshes and cooldowns do not generate
    /// spurious Modify events.
    pub fn same_source(&self, other: &Auth) -> bool {
        self.id == other.id
            && self.provider == other.provider
            && self.label == other.label
            && self.attributes == other.attributes
            && normalize_metadata(&self.metadata) == normalize_metadata(&other.metadata)
            && self.proxy_url == other.proxy_url
            && self.disabled == other.disabled
    }
}

/// Strips volatile fields from file metadata before comparison. Token
/// expiry and bookkeeping timestamps change on every refresh without the
/// credential itself changing.
fn normalize_metadata(metadata: &Value) -> Value {
    const VOLATILE: &[&str] = &[
        "expiry",
        "expires_at",
        "expired",
        "created_at",
        "updated_at",
        "last_refreshed_at",
        "next_refresh_after",
        "access_token",
        "timestamp",
    ];
    match metadata {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if VOLATILE.contains(&k.as_str()) {
                    continue;
                }
                out.insert(k.clone(), normalize_metadata(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth_with_metadata(metadata: Value) -> Auth {
        let mut auth = Auth::new("id-1".into(), "claude".into(), "claude".into());
        auth.metadata = metadata;
        auth
    }

    #[test]
    fn equality_ignores_volatile_metadata() {
        let a = auth_with_metadata(json!({
            "type": "claude",
            "refresh_token": "rt",
            "access_token": "at-1",
            "expiry": "2026-01-01T00:00:00Z"
        }));
        let b = auth_with_metadata(json!({
            "type": "claude",
            "refresh_token": "rt",
            "access_token": "at-2",
            "expiry": "2026-06-01T00:00:00Z"
        }));
        assert!(a.same_source(&b));
    }

    #[test]
    fn equality_sees_material_changes() {
        let a = auth_with_metadata(json!({"type": "claude", "refresh_token": "rt-1"}));
        let b = auth_with_metadata(json!({"type": "claude", "refresh_token": "rt-2"}));
        assert!(!a.same_source(&b));
    }

    #[test]
    fn custom_headers_skip_blank_values() {
        let mut auth = Auth::new("id".into(), "claude".into(), "l".into());
        auth.attributes.insert("header:X-Ms-Region".into(), "eastus2".into());
        auth.attributes.insert("header:Empty".into(), " ".into());
        auth.attributes.insert("api_key".into(), "sk".into());
        let headers: Vec<_> = auth.custom_headers().collect();
        assert_eq!(headers, vec![("X-Ms-Region", "eastus2")]);
    }

    #[test]
    fn disabled_flag_overrides_state() {
        let mut auth = Auth::new("id".into(), "gemini-cli".into(), "l".into());
        auth.disabled = true;
        assert_eq!(auth.status(), AuthStatus::Disabled);
    }
}
