// Credential synthesis: config entries and auth-dir token files are turned
// into the canonical credential set the reconciler diffs against.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::config::{AppConfig, ModelAliasEntry};

use super::{Auth, SharedTokenRuntime, TokenState};

/// Generates stable, deterministic credential ids. The id is a hash of the
/// source material, so the same config entry or file yields the same id
/// across restarts; colliding sources get a `-N` suffix.
pub struct StableIdGenerator {
    counters: HashMap<String, u32>,
}

impl StableIdGenerator {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    /// Returns `(id, short)` where `id` is `kind:digest12` and `short` is
    /// the bare digest used in source labels.
    pub fn next(&mut self, kind: &str, parts: &[&str]) -> (String, String) {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.trim().as_bytes());
        }
        let digest = format!("{:x}", hasher.finalize());
        let mut short = digest[..12].to_string();
        let key = format!("{kind}:{short}");
        let index = self.counters.entry(key).or_insert(0);
        if *index > 0 {
            short = format!("{}-{}", short, index);
        }
        *index += 1;
        (format!("{kind}:{short}"), short)
    }
}

impl Default for StableIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn headers_to_attrs(headers: &BTreeMap<String, String>, attrs: &mut BTreeMap<String, String>) {
    for (name, value) in headers {
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        attrs.insert(format!("header:{name}"), value.to_string());
    }
}

fn models_to_attr(models: &[ModelAliasEntry]) -> Option<String> {
    let kept: Vec<&ModelAliasEntry> = models
        .iter()
        .filter(|m| !m.name.trim().is_empty() || !m.alias.trim().is_empty())
        .collect();
    if kept.is_empty() {
        return None;
    }
    serde_json::to_string(&kept).ok()
}

/// Parses a `models` attribute back into (name, alias) pairs.
pub fn models_from_attr(raw: &str) -> Vec<ModelAliasEntry> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Synthesizes the full credential set from the live config plus every
/// readable `*.json` under the auth directory. Pure apart from directory
/// IO; the reconciler owns when this runs.
pub fn synthesize_credentials(config: &AppConfig, auth_dir: &Path) -> Vec<Arc<Auth>> {
    let mut generator = StableIdGenerator::new();
    let mut out: Vec<Arc<Auth>> = Vec::new();

    synthesize_from_config(config, &mut generator, &mut out);
    synthesize_from_auth_dir(auth_dir, &mut out);

    out
}

pub fn synthesize_from_config(
    config: &AppConfig,
    generator: &mut StableIdGenerator,
    out: &mut Vec<Arc<Auth>>,
) {
    for entry in &config.gemini_api_key {
        let key = entry.api_key.trim();
        if key.is_empty() {
            continue;
        }
        let base = entry.base_url.as_deref().unwrap_or("").trim();
        let (id, short) = generator.next("gemini:apikey", &[key, base]);
        let mut auth = Auth::new(id, "gemini".into(), "gemini-apikey".into());
        auth.attributes.insert("source".into(), format!("config:gemini[{short}]"));
        auth.attributes.insert("api_key".into(), key.to_string());
        if !base.is_empty() {
            auth.attributes.insert("base_url".into(), base.to_string());
        }
        headers_to_attrs(&entry.headers, &mut auth.attributes);
        auth.proxy_url = entry.proxy_url.as_deref().map(str::trim).filter(|p| !p.is_empty()).map(String::from);
        out.push(Arc::new(auth));
    }

    for entry in &config.claude_api_key {
        let key = entry.api_key.trim();
        if key.is_empty() {
            continue;
        }
        let base = entry.base_url.as_deref().unwrap_or("").trim();
        let (id, short) = generator.next("claude:apikey", &[key, base]);
        let mut auth = Auth::new(id, "claude".into(), "claude-apikey".into());
        auth.attributes.insert("source".into(), format!("config:claude[{short}]"));
        auth.attributes.insert("api_key".into(), key.to_string());
        if !base.is_empty() {
            auth.attributes.insert("base_url".into(), base.to_string());
        }
        if let Some(models) = models_to_attr(&entry.models) {
            auth.attributes.insert("models".into(), models);
        }
        headers_to_attrs(&entry.headers, &mut auth.attributes);
        auth.proxy_url = entry.proxy_url.as_deref().map(str::trim).filter(|p| !p.is_empty()).map(String::from);
        out.push(Arc::new(auth));
    }

    for entry in &config.codex_api_key {
        let key = entry.api_key.trim();
        if key.is_empty() {
            continue;
        }
        let base = entry.base_url.as_deref().unwrap_or("").trim();
        let provider_type = entry
            .provider_type
            .as_deref()
            .map(|p| p.trim().to_lowercase())
            .unwrap_or_default();

        if !provider_type.is_empty() {
            // Cross-provider routing: one credential per declared alias,
            // each carrying its own upstream model name.
            for model in &entry.models {
                let alias = model.alias.trim();
                if alias.is_empty() {
                    continue;
                }
                let kind = format!("cross-provider:{provider_type}:{alias}");
                let (id, short) = generator.next(&kind, &[key, base, alias]);
                let mut auth = Auth::new(
                    id,
                    format!("cross-provider-{provider_type}"),
                    format!("cross-provider-{provider_type}:{alias}"),
                );
                auth.attributes
                    .insert("source".into(), format!("config:codex-cross-provider[{short}]"));
                auth.attributes.insert("api_key".into(), key.to_string());
                auth.attributes.insert("provider_type".into(), provider_type.clone());
                auth.attributes.insert("model_alias".into(), alias.to_string());
                auth.attributes
                    .insert("model_name".into(), model.name.trim().to_string());
                if !base.is_empty() {
                    auth.attributes.insert("base_url".into(), base.to_string());
                }
                headers_to_attrs(&entry.headers, &mut auth.attributes);
                auth.proxy_url = entry.proxy_url.as_deref().map(str::trim).filter(|p| !p.is_empty()).map(String::from);
                out.push(Arc::new(auth));
            }
            continue;
        }

        let (id, short) = generator.next("codex:apikey", &[key, base]);
        let mut auth = Auth::new(id, "codex".into(), "codex-apikey".into());
        auth.attributes.insert("source".into(), format!("config:codex[{short}]"));
        auth.attributes.insert("api_key".into(), key.to_string());
        if !base.is_empty() {
            auth.attributes.insert("base_url".into(), base.to_string());
        }
        if let Some(models) = models_to_attr(&entry.models) {
            auth.attributes.insert("models".into(), models);
        }
        headers_to_attrs(&entry.headers, &mut auth.attributes);
        auth.proxy_url = entry.proxy_url.as_deref().map(str::trim).filter(|p| !p.is_empty()).map(String::from);
        out.push(Arc::new(auth));
    }

    for compat in &config.openai_compatibility {
        let provider_name = {
            let name = compat.name.trim().to_lowercase();
            if name.is_empty() {
                "openai-compatibility".to_string()
            } else {
                name
            }
        };
        let base = compat.base_url.trim();
        let kind = format!("openai-compatibility:{provider_name}");
        let models = models_to_attr(&compat.models);

        let mut push_entry = |key: &str, proxy: Option<&str>, generator: &mut StableIdGenerator| {
            let proxy = proxy.map(str::trim).filter(|p| !p.is_empty());
            let (id, short) = generator.next(&kind, &[key, base, proxy.unwrap_or("")]);
            let mut auth = Auth::new(id, provider_name.clone(), compat.name.clone());
            auth.attributes
                .insert("source".into(), format!("config:{provider_name}[{short}]"));
            auth.attributes.insert("base_url".into(), base.to_string());
            auth.attributes.insert("compat_name".into(), compat.name.clone());
            if !key.is_empty() {
                auth.attributes.insert("api_key".into(), key.to_string());
            }
            if let Some(models) = &models {
                auth.attributes.insert("models".into(), models.clone());
            }
            headers_to_attrs(&compat.headers, &mut auth.attributes);
            auth.proxy_url = proxy.map(String::from);
            out.push(Arc::new(auth));
        };

        if !compat.api_key_entries.is_empty() {
            for key_entry in &compat.api_key_entries {
                push_entry(key_entry.api_key.trim(), key_entry.proxy_url.as_deref(), generator);
            }
        } else if !compat.api_keys.is_empty() {
            for key in &compat.api_keys {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                push_entry(key, None, generator);
            }
        } else {
            // Keyless endpoint (e.g. a local inference server).
            push_entry("", None, generator);
        }
    }
}

fn synthesize_from_auth_dir(auth_dir: &Path, out: &mut Vec<Arc<Auth>>) {
    let entries = match std::fs::read_dir(auth_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut paths: Vec<std::path::PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("json"))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        match load_auth_file(&path) {
            Some(mut auths) => out.append(&mut auths),
            None => {
                tracing::warn!(path = %path.display(), "skipping unreadable or invalid auth file");
            }
        }
    }
}

/// Reads one token file. The `type` field selects the provider; everything
/// else rides along as opaque metadata. Gemini OAuth files carrying a
/// comma-separated `project_id` expand into a disabled primary plus one
/// virtual child per project.
pub fn load_auth_file(path: &Path) -> Option<Vec<Arc<Auth>>> {
    let data = std::fs::read(path).ok()?;
    if data.is_empty() {
        return None;
    }
    let metadata: Value = serde_json::from_slice(&data).ok()?;
    let file_type = metadata.get("type")?.as_str()?.trim().to_lowercase();
    if file_type.is_empty() {
        return None;
    }

    let provider = if file_type == "gemini" {
        "gemini-cli".to_string()
    } else {
        file_type.clone()
    };
    let label = metadata
        .get("email")
        .and_then(|v| v.as_str())
        .filter(|e| !e.is_empty())
        .unwrap_or(&provider)
        .to_string();

    let full = path.to_string_lossy().to_string();
    let id = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .unwrap_or_else(|| full.clone());

    let mut auth = Auth::new(id, provider.clone(), label.clone());
    auth.attributes.insert("source".into(), full.clone());
    auth.attributes.insert("path".into(), full.clone());
    auth.metadata = metadata.clone();
    auth.proxy_url = metadata
        .get("proxy_url")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from);

    if provider == "gemini-cli" {
        let projects = split_project_ids(&metadata);
        if projects.len() > 1 {
            return Some(expand_gemini_virtuals(auth, &metadata, &projects));
        }
    }
    // Every file-backed credential gets a refresh runtime so executors can
    // rotate tokens without re-reading the file.
    auth.runtime = Some(Arc::new(runtime_from_metadata(&metadata)));
    Some(vec![Arc::new(auth)])
}

fn runtime_from_metadata(metadata: &Value) -> SharedTokenRuntime {
    let token = metadata.get("token").unwrap_or(metadata);
    let state = TokenState {
        access_token: token
            .get("access_token")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        refresh_token: token
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        expiry: token
            .get("expiry")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
    };
    SharedTokenRuntime {
        refresh_lock: tokio::sync::Mutex::new(()),
        token: parking_lot::RwLock::new(state),
    }
}

/// One Gemini OAuth account, many Cloud projects: the primary credential is
/// disabled and each project becomes an independently routable child
/// sharing the parent's refresh runtime.
fn expand_gemini_virtuals(mut primary: Auth, metadata: &Value, projects: &[String]) -> Vec<Arc<Auth>> {
    let shared = Arc::new(runtime_from_metadata(metadata));
    primary.disabled = true;
    primary.runtime = Some(shared.clone());
    primary
        .attributes
        .insert("gemini_virtual_primary".into(), "true".into());
    primary
        .attributes
        .insert("virtual_children".into(), projects.join(","));

    let email = metadata.get("email").and_then(|v| v.as_str()).unwrap_or_default();
    let source = primary.attributes.get("source").cloned();
    let path = primary.attributes.get("path").cloned();
    let parent_id = primary.id.clone();
    let label = primary.label.clone();
    let proxy_url = primary.proxy_url.clone();

    let mut out: Vec<Arc<Auth>> = Vec::with_capacity(projects.len() + 1);
    out.push(Arc::new(primary));
    for project in projects {
        let safe_project: String = project
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ' ') { '_' } else { c })
            .collect();
        let mut child = Auth::new(
            format!("{parent_id}::{safe_project}"),
            "gemini-cli".into(),
            format!("{label} [{project}]"),
        );
        child.attributes.insert("gemini_virtual_parent".into(), parent_id.clone());
        child.attributes.insert("gemini_virtual_project".into(), project.clone());
        if let Some(source) = &source {
            child.attributes.insert("source".into(), source.clone());
        }
        if let Some(path) = &path {
            child.attributes.insert("path".into(), path.clone());
        }
        child.metadata = serde_json::json!({
            "type": metadata.get("type"),
            "email": email,
            "project_id": project,
            "virtual": true,
            "virtual_parent_id": parent_id,
        });
        child.proxy_url = proxy_url.clone();
        child.runtime = Some(shared.clone());
        out.push(Arc::new(child));
    }
    out
}

fn split_project_ids(metadata: &Value) -> Vec<String> {
    let raw = metadata
        .get("project_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter(|p| seen.insert(p.to_string()))
        .map(String::from)
        .collect()
}
