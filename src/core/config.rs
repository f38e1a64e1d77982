use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::services::compositor::ExportConfig;
use crate::services::image::ImageConfig;
use crate::services::retry::RetryPolicy;
use crate::services::speech::SpeechConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_script")]
    pub script_file: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_vault")]
    pub vault_file: String,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default = "default_target_languages")]
    pub target_languages: Vec<String>,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VaultConfig {
    /// Monthly cap given to newly registered keys.
    #[serde(default = "default_usage_cap")]
    pub default_cap: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            default_cap: default_usage_cap(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(default_max_attempts(), default_base_delay_ms())
    }
}

fn default_script() -> String {
    "script.txt".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_vault() -> String {
    "vault.json".to_string()
}
fn default_target_languages() -> Vec<String> {
    vec!["bn-BD".to_string(), "hi-IN".to_string(), "en-US".to_string()]
}
fn default_usage_cap() -> u32 {
    1500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            script_file: default_script(),
            output_folder: default_output(),
            vault_file: default_vault(),
            unattended: false,
            target_languages: default_target_languages(),
            image: ImageConfig::default(),
            speech: SpeechConfig::default(),
            vault: VaultConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_folder)
    }
}
