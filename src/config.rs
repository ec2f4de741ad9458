//! Configuration: CLI flags override environment; a local config file
//! overrides both for non-secret settings. `toml` replaces the YAML config
//! layer used elsewhere in this codebase's history since there is no YAML
//! document anywhere in this system.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Cli;

fn default_max_concurrency() -> usize {
    3
}

fn default_pages_per_image() -> u32 {
    5
}

fn default_style_bootstrap_count() -> u32 {
    3
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Non-secret settings loadable from `bookwright.toml` in the output
/// directory or current directory. Secrets (API keys) never live here —
/// they come from the environment or `--api-key`/`--image-key`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_pages_per_image")]
    pub pages_per_image: u32,
    #[serde(default = "default_style_bootstrap_count")]
    pub style_bootstrap_count: u32,
    #[serde(default = "default_confidence_threshold")]
    pub entity_match_confidence_threshold: f64,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            model: None,
            provider: None,
            base_url: None,
            max_concurrency: default_max_concurrency(),
            pages_per_image: default_pages_per_image(),
            style_bootstrap_count: default_style_bootstrap_count(),
            entity_match_confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl FileConfig {
    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join("bookwright.toml");
        if !path.exists() {
            return Ok(FileConfig::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: FileConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}

/// The fully resolved configuration after CLI > env > file precedence.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub model: String,
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub image_api_key: Option<String>,
    pub max_concurrency: usize,
    pub pages_per_image: u32,
    pub style_bootstrap_count: u32,
    pub entity_match_confidence_threshold: f64,
}

pub fn resolve(cli: &Cli, file: &FileConfig) -> Result<ResolvedConfig> {
    let model = cli
        .model
        .clone()
        .or_else(|| file.model.clone())
        .unwrap_or_else(|| "gpt-4o".to_string());
    let provider = cli
        .provider
        .clone()
        .or_else(|| file.provider.clone())
        .unwrap_or_else(|| "openai".to_string());
    let base_url = file.base_url.clone().unwrap_or_else(default_base_url);

    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var("BOOKWRIGHT_API_KEY").ok())
        .context("no API key: pass --api-key or set BOOKWRIGHT_API_KEY")?;
    let image_api_key = cli
        .image_key
        .clone()
        .or_else(|| std::env::var("BOOKWRIGHT_IMAGE_API_KEY").ok());

    Ok(ResolvedConfig {
        model,
        provider,
        base_url,
        api_key,
        image_api_key,
        max_concurrency: file.max_concurrency,
        pages_per_image: file.pages_per_image,
        style_bootstrap_count: file.style_bootstrap_count,
        entity_match_confidence_threshold: file.entity_match_confidence_threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cli_api_key_overrides_env_and_file() {
        let cli = Cli::parse_from(["bookwright", "book/", "--api-key", "cli-key"]);
        let file = FileConfig::default();
        let resolved = resolve(&cli, &file).unwrap();
        assert_eq!(resolved.api_key, "cli-key");
    }

    #[test]
    fn missing_api_key_is_an_error() {
        // SAFETY: this test only reads/removes a process-local env var for
        // the duration of one synchronous assertion; no other thread in this
        // test binary touches BOOKWRIGHT_API_KEY.
        unsafe {
            std::env::remove_var("BOOKWRIGHT_API_KEY");
        }
        let cli = Cli::parse_from(["bookwright", "book/"]);
        let file = FileConfig::default();
        assert!(resolve(&cli, &file).is_err());
    }

    #[test]
    fn file_config_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileConfig::load(dir.path()).unwrap();
        assert_eq!(file.max_concurrency, 3);
        assert_eq!(file.style_bootstrap_count, 3);
    }
}
