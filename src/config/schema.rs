use crate::error::{AssistantError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub anthropic: ProviderConfig,
    pub openai: ProviderConfig,
    pub local: LocalConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ModelsConfig {
    /// Overrides the platform models directory
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub catalog: CatalogSource,
}

/// Where the list of downloadable models comes from
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum CatalogSource {
    #[default]
    Builtin,
    File {
        path: PathBuf,
    },
    Url {
        url: String,
    },
}

/// Settings shared by the remote chat providers.
///
/// Missing fields are filled per provider by [`Config::anthropic`] /
/// [`Config::openai`] defaults, so `base_url` and `api_key_env` are optional here.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub verify_on_init: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LocalConfig {
    #[serde(default = "default_simulated_step_ms")]
    pub simulated_step_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DefaultsConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_simulated_step_ms() -> u64 {
    500
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            api_key_env: None,
            base_url: None,
            models: Vec::new(),
            timeout_secs: None,
            verify_on_init: false,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            simulated_step_ms: default_simulated_step_ms(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("No config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load config from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| AssistantError::Config(format!("{}: {e}", path.display())))
    }

    /// Resolve the models directory (config override or platform default)
    pub fn models_dir(&self) -> Result<PathBuf> {
        match &self.models.directory {
            Some(dir) => Ok(dir.clone()),
            None => crate::models::sidecar::default_models_dir(),
        }
    }
}

/// Get config file path (`$XDG_CONFIG_HOME/ai-assistant/config.toml` or platform equivalent)
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    Some(base.join("ai-assistant").join("config.toml"))
}
