use allochory_core::agents::{Agent, AgentBackend, AgentDescriptor, AgentRegistry};
use allochory_core::ollama::OllamaClient;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllochoryConfig {
    pub channel: ChannelConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelProvider {
    #[default]
    Ably,
    Local,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub provider: ChannelProvider,
    #[serde(default = "default_channel_name")]
    pub name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub greeting: bool,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("api_key", &mask_secret(&self.api_key))
            .field("rest_url", &self.rest_url)
            .field("realtime_url", &self.realtime_url)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("greeting", &self.greeting)
            .finish()
    }
}

fn default_channel_name() -> String {
    "mcp:hello".to_string()
}
fn default_rest_url() -> String {
    "https://rest.ably.io".to_string()
}
fn default_realtime_url() -> String {
    "wss://realtime.ably.io".to_string()
}
fn default_poll_interval() -> u64 {
    2
}
fn default_true() -> bool {
    true
}

const LOCAL_CLIENT_ID: &str = "local";

impl ChannelConfig {
    /// Client id to publish as; local runs fall back to a fixed name
    pub fn effective_client_id(&self) -> &str {
        if self.client_id.is_empty() {
            LOCAL_CLIENT_ID
        } else {
            &self.client_id
        }
    }

    /// Check the settings the Ably adapter needs
    pub fn validate_ably(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(anyhow!(
                "channel.api_key is empty. Set ABLY_API_KEY or use provider = \"local\""
            ));
        }
        if self.client_id.is_empty() {
            return Err(anyhow!("channel.client_id is empty. Set ABLY_CLIENT_ID"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("channel.poll_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_ollama_timeout")]
    pub timeout_secs: u64,
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3".to_string()
}
fn default_ollama_timeout() -> u64 {
    120
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
            timeout_secs: default_ollama_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub publish_errors: bool,
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    #[serde(default = "default_tool")]
    pub default_tool: String,
}

fn default_agent_id() -> String {
    "agent:ollama".to_string()
}
fn default_tool() -> String {
    "summarize".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            publish_errors: false,
            default_agent: default_agent_id(),
            default_tool: default_tool(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    Echo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub backend: BackendKind,
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".allochory")
}

impl AllochoryConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // The config may hold an API key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `allochory init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Expand allowlisted env vars and parse TOML
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        if !config.channel.api_key.is_empty() && !content.contains("${ABLY_API_KEY}") {
            warn!(
                "Ably API key is hardcoded in config file. For security, use environment variables: api_key = \"${{ABLY_API_KEY}}\""
            );
        }

        Ok(config)
    }

    /// Same config with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.channel.api_key = mask_secret(&copy.channel.api_key);
        copy
    }

    /// Build the agent registry described by `[[agents]]`
    pub fn build_registry(&self) -> Result<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for agent in &self.agents {
            let backend = match agent.backend {
                BackendKind::Ollama => AgentBackend::Ollama(OllamaClient::with_timeout(
                    &self.ollama.base_url,
                    &self.ollama.model,
                    Duration::from_secs(self.ollama.timeout_secs),
                )?),
                BackendKind::Echo => AgentBackend::Echo,
            };
            let descriptor = AgentDescriptor::new(&agent.id, &agent.name)
                .with_description(&agent.description)
                .with_tools(agent.tools.iter().cloned());
            registry.register(Agent::new(descriptor, backend));
        }
        if registry.is_empty() {
            warn!("No agents configured; invoke requests will all be reported as unknown agents");
        }
        Ok(registry)
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &[
    "ABLY_API_KEY",
    "ABLY_CLIENT_ID",
    "OLLAMA_HOST",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    expand_with(s, |name| std::env::var(name).ok())
}

fn expand_with(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}
