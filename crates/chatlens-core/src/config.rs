use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "chatlens.yaml";

fn default_base_url() -> String {
    chatlens_provider::http::DEFAULT_API_BASE.to_string()
}

fn default_accepted_extensions() -> Vec<String> {
    vec!["txt".to_string(), "csv".to_string()]
}

fn default_event_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// No timeout when unset.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_accepted_extensions")]
    pub accepted_extensions: Vec<String>,
    /// Queue depth of each event bus subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: None,
            accepted_extensions: default_accepted_extensions(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(anyhow!("base_url must not be empty"));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(anyhow!("base_url must start with http:// or https://: {base_url}"));
        }
        if self.accepted_extensions.is_empty() {
            return Err(anyhow!("accepted_extensions must list at least one extension"));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(anyhow!("request_timeout_secs must be positive"));
        }
        Ok(())
    }

    fn resolve_env(&mut self) {
        self.base_url = resolve_env_var(&self.base_url);
        for ext in &mut self.accepted_extensions {
            *ext = resolve_env_var(ext);
        }
    }

    fn normalize(&mut self) {
        self.base_url = self.base_url.trim().to_string();
        self.accepted_extensions = self
            .accepted_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
    }
}

pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

/// Loads `<root>/chatlens.yaml`, falling back to defaults when the file is absent.
pub fn load_config(root: &Path) -> Result<ClientConfig> {
    let path = root.join(CONFIG_FILE_NAME);
    let mut config = if path.exists() {
        read_yaml_file::<ClientConfig>(&path)?
    } else {
        tracing::debug!("no config at {}, using defaults", path.display());
        ClientConfig::default()
    };

    config.resolve_env();
    config.normalize();
    config.validate()?;
    Ok(config)
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}
