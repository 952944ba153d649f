// Hot-reload reconciler. Polls the config file and the auth directory,
// gates every reload on content hashes, and applies coalesced
// Add/Modify/Delete credential events to the store and model registry.
//
// Polling with hash gating gives atomic-replace coalescing for free: an
// editor renaming a temp file over an auth file is seen as (at most) one
// Modify between ticks, never Delete followed by Add.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::auth::synthesize::synthesize_credentials;
use crate::auth::AuthStore;
use crate::config::AppConfig;
use crate::manager::Manager;
use crate::registry::ModelRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONFIG_DEBOUNCE: Duration = Duration::from_millis(150);

pub struct Watcher {
    config_path: PathBuf,
    config: Arc<AppConfig>,
    auth_dir: PathBuf,
    store: Arc<AuthStore>,
    registry: Arc<ModelRegistry>,
    manager: Arc<Manager>,
    applied_config_hash: Option<String>,
    pending_config_hash: Option<String>,
    pending_config_since: Option<Instant>,
    auth_hashes: HashMap<PathBuf, String>,
}

fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hashes every non-empty `*.json` under the auth directory. Editor
/// sidecars and other extensions are ignored.
fn scan_auth_hashes(auth_dir: &Path) -> HashMap<PathBuf, String> {
    let mut hashes = HashMap::new();
    let entries = match std::fs::read_dir(auth_dir) {
        Ok(entries) => entries,
        Err(_) => return hashes,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json || !path.is_file() {
            continue;
        }
        if let Ok(data) = std::fs::read(&path) {
            if !data.is_empty() {
                hashes.insert(path, content_hash(&data));
            }
        }
    }
    hashes
}

impl Watcher {
    pub fn new(
        config_path: PathBuf,
        config: Arc<AppConfig>,
        store: Arc<AuthStore>,
        registry: Arc<ModelRegistry>,
        manager: Arc<Manager>,
    ) -> Self {
        let auth_dir = config.resolve_auth_dir();
        let applied_config_hash = std::fs::read(&config_path)
            .ok()
            .filter(|data| !data.is_empty())
            .map(|data| content_hash(&data));
        Self {
            config_path,
            config,
            auth_dir,
            store,
            registry,
            manager,
            applied_config_hash,
            pending_config_hash: None,
            pending_config_since: None,
            auth_hashes: HashMap::new(),
        }
    }

    /// Runs the reconcile loop until cancelled. Reconciliations are
    /// serialized by construction: this task is the only writer.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.reconcile();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.poll_config();
            self.poll_auth_dir();
        }
    }

    /// Debounced config reload: a changed hash must hold still for the
    /// debounce window before the file is parsed. Identical content and
    /// empty files are no-ops; parse failures keep the running config.
    fn poll_config(&mut self) {
        let data = match std::fs::read(&self.config_path) {
            Ok(data) => data,
            Err(_) => return,
        };
        if data.is_empty() {
            return;
        }
        let hash = content_hash(&data);
        if Some(&hash) == self.applied_config_hash.as_ref() {
            self.pending_config_hash = None;
            self.pending_config_since = None;
            return;
        }
        if self.pending_config_hash.as_ref() != Some(&hash) {
            self.pending_config_hash = Some(hash);
            self.pending_config_since = Some(Instant::now());
            return;
        }
        let stable_for = self
            .pending_config_since
            .map(|since| since.elapsed())
            .unwrap_or_default();
        if stable_for < CONFIG_DEBOUNCE {
            return;
        }
        self.pending_config_hash = None;
        self.pending_config_since = None;
        self.reload_config(hash);
    }

    fn reload_config(&mut self, new_hash: String) {
        tracing::info!(path = %self.config_path.display(), "config file changed, reloading");
        let new_config = match AppConfig::load(&self.config_path) {
            Ok(config) => Arc::new(config),
            Err(error) => {
                tracing::error!(error = %error, "config reload failed, keeping previous config");
                // Remember the hash so a broken file is not re-parsed every tick.
                self.applied_config_hash = Some(new_hash);
                return;
            }
        };
        for change in config_change_details(&self.config, &new_config) {
            tracing::info!(change, "config change");
        }
        self.auth_dir = new_config.resolve_auth_dir();
        self.config = new_config.clone();
        self.manager.set_config(new_config);
        self.applied_config_hash = Some(new_hash);
        self.reconcile();
    }

    fn poll_auth_dir(&mut self) {
        let current = scan_auth_hashes(&self.auth_dir);
        if current == self.auth_hashes {
            return;
        }
        for path in current.keys() {
            match self.auth_hashes.get(path) {
                None => tracing::info!(file = %path.display(), "auth file added"),
                Some(previous) if previous != &current[path] => {
                    tracing::info!(file = %path.display(), "auth file changed")
                }
                _ => {}
            }
        }
        for path in self.auth_hashes.keys() {
            if !current.contains_key(path) {
                tracing::info!(file = %path.display(), "auth file removed");
            }
        }
        self.reconcile();
    }

    /// Synthesizes the full credential set from config plus disk, diffs it
    /// against the store, and applies the result to store and registry.
    pub fn reconcile(&mut self) {
        self.auth_hashes = scan_auth_hashes(&self.auth_dir);
        let next = synthesize_credentials(&self.config, &self.auth_dir);
        let updates = self.store.diff(&next);
        if updates.is_empty() {
            return;
        }
        for update in &updates {
            tracing::info!(action = update.action(), id = update.id(), "credential update");
        }
        self.store.apply(&updates);
        let snapshot = self.store.snapshot();
        self.registry.rebuild(snapshot.values());
        tracing::info!(
            credentials = snapshot.len(),
            events = updates.len(),
            "reconcile complete"
        );
    }

    #[cfg(test)]
    fn last_updates_for_test(&mut self) -> Vec<crate::auth::AuthUpdate> {
        // Test hook: compute the diff the next reconcile would apply.
        let next = synthesize_credentials(&self.config, &self.auth_dir);
        self.store.diff(&next)
    }
}

/// Redacted, human-readable config diff for the reload log. Key material
/// never appears; only counts and non-sensitive scalars do.
fn config_change_details(old: &AppConfig, new: &AppConfig) -> Vec<String> {
    let mut changes = Vec::new();
    if old.port != new.port {
        changes.push(format!("port: {} -> {}", old.port, new.port));
    }
    if old.auth_dir != new.auth_dir {
        changes.push(format!("auth-dir: {} -> {}", old.auth_dir, new.auth_dir));
    }
    if old.debug != new.debug {
        changes.push(format!("debug: {} -> {}", old.debug, new.debug));
    }
    if old.logging_to_file != new.logging_to_file {
        changes.push(format!(
            "logging-to-file: {} -> {}",
            old.logging_to_file, new.logging_to_file
        ));
    }
    if old.request_retry != new.request_retry {
        changes.push(format!("request-retry: {} -> {}", old.request_retry, new.request_retry));
    }
    if old.max_retry_interval != new.max_retry_interval {
        changes.push(format!(
            "max-retry-interval: {} -> {}",
            old.max_retry_interval, new.max_retry_interval
        ));
    }
    if old.proxy_url != new.proxy_url {
        changes.push(format!("proxy-url: {} -> {}", old.proxy_url, new.proxy_url));
    }
    if old.fallback_upstream != new.fallback_upstream {
        changes.push(format!(
            "fallback-upstream: {} -> {}",
            old.fallback_upstream, new.fallback_upstream
        ));
    }
    if old.api_keys.len() != new.api_keys.len() {
        changes.push(format!(
            "api-keys count: {} -> {}",
            old.api_keys.len(),
            new.api_keys.len()
        ));
    } else if old.api_keys != new.api_keys {
        changes.push("api-keys: values updated (redacted)".to_string());
    }
    if old.gemini_api_key.len() != new.gemini_api_key.len() {
        changes.push(format!(
            "gemini-api-key count: {} -> {}",
            old.gemini_api_key.len(),
            new.gemini_api_key.len()
        ));
    }
    if old.claude_api_key.len() != new.claude_api_key.len() {
        changes.push(format!(
            "claude-api-key count: {} -> {}",
            old.claude_api_key.len(),
            new.claude_api_key.len()
        ));
    }
    if old.codex_api_key.len() != new.codex_api_key.len() {
        changes.push(format!(
            "codex-api-key count: {} -> {}",
            old.codex_api_key.len(),
            new.codex_api_key.len()
        ));
    }
    if old.openai_compatibility.len() != new.openai_compatibility.len() {
        changes.push(format!(
            "openai-compatibility count: {} -> {}",
            old.openai_compatibility.len(),
            new.openai_compatibility.len()
        ));
    }
    if old.quota_exceeded.switch_project != new.quota_exceeded.switch_project {
        changes.push(format!(
            "quota-exceeded.switch-project: {} -> {}",
            old.quota_exceeded.switch_project, new.quota_exceeded.switch_project
        ));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStore;
    use crate::registry::ModelRegistry;
    use serde_json::json;

    fn watcher_in(dir: &Path) -> Watcher {
        let config_path = dir.join("config.yaml");
        std::fs::write(
            &config_path,
            format!("port: 9000\nauth-dir: {}\n", dir.join("auth").display()),
        )
        .unwrap();
        std::fs::create_dir_all(dir.join("auth")).unwrap();
        let config = Arc::new(AppConfig::load(&config_path).unwrap());
        let store = Arc::new(AuthStore::new());
        let registry = Arc::new(ModelRegistry::new());
        let manager = Arc::new(Manager::new(store.clone(), registry.clone(), config.clone()));
        Watcher::new(config_path, config, store, registry, manager)
    }

    fn write_auth(dir: &Path, name: &str, body: serde_json::Value) {
        std::fs::write(dir.join("auth").join(name), body.to_string()).unwrap();
    }

    #[test]
    fn adding_an_auth_file_registers_its_models() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(dir.path());
        watcher.reconcile();
        assert!(watcher.registry.is_empty());

        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "email": "user@example.com", "access_token": "at"}),
        );
        watcher.reconcile();
        assert_eq!(watcher.store.len(), 1);
        assert!(!watcher.registry.lookup("claude-opus-4-5-20251101").is_empty());
    }

    #[test]
    fn unchanged_content_produces_no_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(dir.path());
        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "refresh_token": "rt"}),
        );
        watcher.reconcile();
        // Touch the file with identical content (atomic-replace shape).
        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "refresh_token": "rt"}),
        );
        assert!(watcher.last_updates_for_test().is_empty());
    }

    #[test]
    fn atomic_replace_with_new_content_is_a_single_modify() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(dir.path());
        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "refresh_token": "rt-1"}),
        );
        watcher.reconcile();
        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "refresh_token": "rt-2"}),
        );
        let updates = watcher.last_updates_for_test();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].action(), "modify");
    }

    #[test]
    fn token_refresh_fields_do_not_trigger_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(dir.path());
        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "refresh_token": "rt", "access_token": "a1", "expiry": "2026-01-01T00:00:00Z"}),
        );
        watcher.reconcile();
        write_auth(
            dir.path(),
            "claude_user.json",
            json!({"type": "claude", "refresh_token": "rt", "access_token": "a2", "expiry": "2026-06-01T00:00:00Z"}),
        );
        assert!(watcher.last_updates_for_test().is_empty());
    }

    #[test]
    fn deleting_a_file_deletes_its_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(dir.path());
        write_auth(dir.path(), "claude_user.json", json!({"type": "claude"}));
        watcher.reconcile();
        assert_eq!(watcher.store.len(), 1);
        std::fs::remove_file(dir.path().join("auth/claude_user.json")).unwrap();
        watcher.reconcile();
        assert_eq!(watcher.store.len(), 0);
    }

    #[test]
    fn invalid_json_is_ignored_without_breaking_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = watcher_in(dir.path());
        write_auth(dir.path(), "good.json", json!({"type": "claude"}));
        std::fs::write(dir.path().join("auth/bad.json"), "{broken").unwrap();
        watcher.reconcile();
        assert_eq!(watcher.store.len(), 1);
    }

    #[test]
    fn empty_files_and_sidecars_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("auth")).unwrap();
        std::fs::write(dir.path().join("auth/empty.json"), "").unwrap();
        std::fs::write(dir.path().join("auth/token.json~"), "backup").unwrap();
        std::fs::write(dir.path().join("auth/session.cookie"), "c").unwrap();
        let hashes = scan_auth_hashes(&dir.path().join("auth"));
        assert!(hashes.is_empty());
    }

    #[test]
    fn config_diff_redacts_key_material() {
        let old = AppConfig {
            api_keys: vec!["secret-1".into()],
            ..Default::default()
        };
        let new = AppConfig {
            api_keys: vec!["secret-2".into()],
            ..Default::default()
        };
        let changes = config_change_details(&old, &new);
        assert_eq!(changes, vec!["api-keys: values updated (redacted)"]);
        assert!(!changes.iter().any(|c| c.contains("secret")));
    }
}
