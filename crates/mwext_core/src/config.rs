use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_API_URL;

pub const DEFAULT_USER_AGENT: &str = "mwext/0.1";
pub const CONFIG_DIR_NAME: &str = ".mwext";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MwextConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// `[registry]` section. Environment overrides are applied later, when the
/// client configuration is built.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

impl RegistryConfig {
    pub fn api_url(&self) -> String {
        non_empty(self.api_url.as_deref())
            .unwrap_or(DEFAULT_API_URL)
            .to_string()
    }

    pub fn user_agent(&self) -> String {
        non_empty(self.user_agent.as_deref())
            .unwrap_or(DEFAULT_USER_AGENT)
            .to_string()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Load and parse the TOML config. A missing file yields the defaults.
pub fn load_config(config_path: &Path) -> Result<MwextConfig> {
    if !config_path.exists() {
        tracing::debug!("no config at {}; using defaults", config_path.display());
        return Ok(MwextConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MwextConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
