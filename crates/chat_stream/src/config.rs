use crate::error::ChatError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "client.json";
const CONFIG_DIR: &str = "chat-stream";

/// Connection and dispatch settings for an [`OpenAIClient`](crate::OpenAIClient).
///
/// String values may reference environment variables as `${VAR_NAME}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as the `OpenAI-Organization` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Switches the client to the Azure deployment URL and `api-key` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureConfig>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureConfig {
    pub deployment: String,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
}

/// Bounds for the tool dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of requests one `run` may issue.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl DispatchConfig {
    /// A run must be allowed at least one request.
    pub fn validate(&self) -> std::result::Result<(), ChatError> {
        if self.max_iterations == 0 {
            return Err(ChatError::Config(
                "dispatch.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

pub fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_azure_api_version() -> String {
    "2023-03-15-preview".to_string()
}

fn default_max_iterations() -> u32 {
    10
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: default_base_url(),
            organization: None,
            azure: None,
            dispatch: DispatchConfig::default(),
        }
    }

    /// Load from the first `client.json` found in the default locations.
    pub fn load() -> Result<Self> {
        let searched_paths: Vec<PathBuf> = config_directories()
            .into_iter()
            .map(|dir| dir.join(CONFIG_FILE))
            .collect();

        match searched_paths.iter().find(|path| path.exists()) {
            Some(path) => Self::load_from_path(path),
            None => Err(missing_config_error(&searched_paths)),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config: {}", path.display()))?;

        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse client config: {}", path.display()))?;

        let value = substitute_env_vars_in_value(value)
            .with_context(|| format!("Failed to substitute env vars in: {}", path.display()))?;

        let config: Self = serde_json::from_value(value)
            .with_context(|| format!("Invalid client config: {}", path.display()))?;
        config
            .dispatch
            .validate()
            .with_context(|| format!("Invalid client config: {}", path.display()))?;
        Ok(config)
    }
}

/// Recursively substitute environment variables in JSON string values
fn substitute_env_vars_in_value(value: Value) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(substitute_env_vars_in_string(&s)?),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| Ok((key, substitute_env_vars_in_value(val)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(substitute_env_vars_in_value)
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

/// Substitute `${VAR_NAME}` placeholders. Substituted values are not scanned again.
fn substitute_env_vars_in_string(input: &str) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            anyhow::anyhow!("Unclosed environment variable substitution: {input}")
        })?;

        let var_name = &after[..end];
        let var_value = std::env::var(var_name)
            .with_context(|| format!("Environment variable not set: {var_name}"))?;
        result.push_str(&var_value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}

/// Directories that may contain `client.json`, ordered by priority
fn config_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(custom_dir) = std::env::var("CHAT_STREAM_CONFIG_DIR") {
        push_unique_dir(&mut dirs, PathBuf::from(custom_dir));
    }
    if let Some(system_config) = dirs::config_dir() {
        push_unique_dir(&mut dirs, system_config.join(CONFIG_DIR));
    }
    if let Ok(current_dir) = std::env::current_dir() {
        push_unique_dir(&mut dirs, current_dir);
    }

    dirs
}

fn push_unique_dir(dirs: &mut Vec<PathBuf>, candidate: PathBuf) {
    if !dirs.iter().any(|existing| existing == &candidate) {
        dirs.push(candidate);
    }
}

fn missing_config_error(searched_paths: &[PathBuf]) -> anyhow::Error {
    let searched_display = if searched_paths.is_empty() {
        "  (no search paths available)".to_string()
    } else {
        searched_paths
            .iter()
            .map(|path| format!("  {}", path.display()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    anyhow::anyhow!("Client configuration file not found.\nSearched locations:\n{searched_display}")
}
