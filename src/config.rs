use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Result, anyhow};

/// Environment variable checked before the config file for the bearer token.
const API_KEY_ENV: &str = "TOGETHER_API_KEY";

/// Endpoint address and request constraints.
///
/// Defaults mirror what the app ships with: the Together AI chat-completions
/// endpoint with Llama 2 chat stop sequences. Fields missing from the config
/// file fall back to those defaults.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            base_url: "https://api.together.xyz/v1/chat/completions".to_string(),
            api_key: None,
            model: "meta-llama/Llama-2-7b-chat-hf".to_string(),
            max_tokens: 1024,
            stop: vec!["</s>".to_string(), "[/INST]".to_string()],
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    /// Bearer token resolution: environment first, then the config file.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .or_else(|| self.api_key.clone())
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(path, config_content)?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("charla").join("config.json"))
    }
}
