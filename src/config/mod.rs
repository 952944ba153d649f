// Configuration loading and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_auth_dir")]
    pub auth_dir: String,

    /// Client-facing API keys. Empty disables client authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub logging_to_file: bool,

    /// Process-default outbound proxy. Credentials may override per entry.
    #[serde(default)]
    pub proxy_url: String,

    #[serde(default = "default_request_retry")]
    pub request_retry: u32,

    /// Upper bound in seconds for honoring upstream Retry-After headers.
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval: u32,

    /// Optional upstream to forward requests for which no credential exists.
    #[serde(default)]
    pub fallback_upstream: String,

    #[serde(default)]
    pub quota_exceeded: QuotaExceededConfig,

    #[serde(default)]
    pub gemini_api_key: Vec<GeminiKeyEntry>,

    #[serde(default)]
    pub claude_api_key: Vec<ClaudeKeyEntry>,

    #[serde(default)]
    pub codex_api_key: Vec<CodexKeyEntry>,

    #[serde(default)]
    pub openai_compatibility: Vec<OpenAiCompatEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            auth_dir: default_auth_dir(),
            api_keys: Vec::new(),
            debug: false,
            logging_to_file: false,
            proxy_url: String::new(),
            request_retry: default_request_retry(),
            max_retry_interval: default_max_retry_interval(),
            fallback_upstream: String::new(),
            quota_exceeded: QuotaExceededConfig::default(),
            gemini_api_key: Vec::new(),
            claude_api_key: Vec::new(),
            codex_api_key: Vec::new(),
            openai_compatibility: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    8417
}

fn default_auth_dir() -> String {
    "~/.polygate".to_string()
}

fn default_request_retry() -> u32 {
    3
}

fn default_max_retry_interval() -> u32 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaExceededConfig {
    #[serde(default = "default_true")]
    pub switch_project: bool,
    #[serde(default = "default_true")]
    pub switch_preview_model: bool,
}

impl Default for QuotaExceededConfig {
    fn default() -> Self {
        Self {
            switch_project: true,
            switch_preview_model: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GeminiKeyEntry {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ClaudeKeyEntry {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub models: Vec<ModelAliasEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CodexKeyEntry {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    /// When set (only "claude" is supported), each model alias below is
    /// synthesized into a cross-provider credential.
    #[serde(default)]
    pub provider_type: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelAliasEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ModelAliasEntry {
    pub name: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OpenAiCompatEntry {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub api_key_entries: Vec<CompatKeyEntry>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub models: Vec<ModelAliasEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CompatKeyEntry {
    pub api_key: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would synthesize credentials that can
    /// never succeed. `provider-type` values other than "claude" are an
    /// error; a cross-provider entry without models is allowed but inert.
    pub fn validate(&self) -> Result<()> {
        for (i, entry) in self.codex_api_key.iter().enumerate() {
            if let Some(provider_type) = &entry.provider_type {
                let normalized = provider_type.trim().to_lowercase();
                if normalized.is_empty() {
                    continue;
                }
                if normalized != "claude" {
                    anyhow::bail!(
                        "codex-api-key[{}]: unsupported provider-type {:?} (only \"claude\" is supported)",
                        i,
                        provider_type
                    );
                }
                if entry.models.iter().all(|m| m.alias.trim().is_empty()) {
                    tracing::warn!(
                        "codex-api-key[{}]: provider-type set but no model aliases declared; no cross-provider credentials will be created",
                        i
                    );
                }
            }
        }
        Ok(())
    }

    pub fn resolve_auth_dir(&self) -> PathBuf {
        expand_home(&self.auth_dir)
    }

    /// Client auth keys merged with the environment override.
    pub fn client_api_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .api_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if let Ok(env_key) = std::env::var("POLYGATE_API_KEY") {
            let env_key = env_key.trim().to_string();
            if !env_key.is_empty() && !keys.contains(&env_key) {
                keys.push(env_key);
            }
        }
        keys
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: AppConfig = serde_yaml::from_str("port: 9000\n").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.request_retry, 3);
        assert_eq!(config.auth_dir, "~/.polygate");
        assert!(config.quota_exceeded.switch_project);
        assert!(config.api_keys.is_empty());
    }

    #[test]
    fn parses_cross_provider_entry() {
        let yaml = r#"
codex-api-key:
  - api-key: sk-azure
    base-url: https://foundry.example.com
    provider-type: claude
    models:
      - name: claude-opus-4-5
        alias: gpt-5
      - name: claude-sonnet-4-5
        alias: gpt-5-mini
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.codex_api_key.len(), 1);
        assert_eq!(config.codex_api_key[0].models.len(), 2);
        assert_eq!(config.codex_api_key[0].models[0].alias, "gpt-5");
    }

    #[test]
    fn rejects_unsupported_provider_type() {
        let yaml = r#"
codex-api-key:
  - api-key: sk-x
    provider-type: gemini
    models:
      - name: g
        alias: a
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_openai_compatibility() {
        let yaml = r#"
openai-compatibility:
  - name: openrouter
    base-url: https://openrouter.ai/api/v1
    api-keys: [sk-or-1]
    models:
      - name: anthropic/claude-sonnet-4.5
        alias: claude-sonnet
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.openai_compatibility[0].models[0].alias, "claude-sonnet");
    }
}
