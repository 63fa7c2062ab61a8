//! Configuration system for infer-pool
//!
//! `ServiceConfig` carries everything `Service::initialize` needs: the model
//! file, per-worker context size, pool size, optional chat template and the
//! default generation settings.

mod generation;

pub use generation::{GenerationConfig, DEFAULT_MAX_TOKENS};

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Default context window per worker (sized for short inputs)
pub const DEFAULT_CONTEXT_SIZE: u32 = 512;

/// Default number of worker threads
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default wait for `generate_sync` before it reports a timeout
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 10_000;

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Path to the model file
    pub model_path: PathBuf,

    /// Context window size for each worker's session
    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Number of worker threads (one session each)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Optional chat template file; absent selects plain concatenation
    #[serde(default)]
    pub chat_template_path: Option<PathBuf>,

    /// How long `generate_sync` waits before giving up
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Default generation settings
    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_context_size() -> u32 {
    DEFAULT_CONTEXT_SIZE
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_sync_timeout_ms() -> u64 {
    DEFAULT_SYNC_TIMEOUT_MS
}

impl ServiceConfig {
    /// Create a config for a model with default settings
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: DEFAULT_CONTEXT_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            chat_template_path: None,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            generation: GenerationConfig::default(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, picking the format from the file extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(path),
            Some("yaml") | Some("yml") => Self::from_yaml(path),
            _ => bail!("unsupported config format: {}", path.display()),
        }
    }

    /// Set the per-worker context size
    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Use a chat template file for prompt formatting
    pub fn with_chat_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.chat_template_path = Some(path.into());
        self
    }

    /// Set the `generate_sync` timeout
    pub fn with_sync_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.sync_timeout_ms = timeout_ms;
        self
    }

    /// Replace the generation settings
    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Check the settings the pool depends on
    pub fn validate(&self) -> Result<()> {
        if self.model_path.as_os_str().is_empty() {
            bail!("model path is empty");
        }
        if self.worker_count == 0 {
            bail!("worker count must be at least 1");
        }
        if self.context_size == 0 {
            bail!("context size must be at least 1");
        }
        if self.generation.max_tokens == 0 {
            bail!("default max_tokens must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_yaml() {
        let yaml = r#"
model_path: /models/pinyin-250215.gguf
worker_count: 4
chat_template_path: /models/pinyin.jinja

generation:
  max_tokens: 16
  temperature: 0.0
"#;
        let config: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model_path, PathBuf::from("/models/pinyin-250215.gguf"));
        assert_eq!(config.context_size, 512);
        assert_eq!(config.worker_count, 4);
        assert_eq!(
            config.chat_template_path,
            Some(PathBuf::from("/models/pinyin.jinja"))
        );
        assert_eq!(config.sync_timeout_ms, DEFAULT_SYNC_TIMEOUT_MS);
        assert_eq!(config.generation.max_tokens, 16);
        assert!(config.generation.is_greedy());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_service_config_json() {
        let json = r#"{"model_path": "model.gguf", "context_size": 1024}"#;
        let config: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.context_size, 1024);
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert!(config.chat_template_path.is_none());
    }

    #[test]
    fn test_builder_defaults() {
        let config = ServiceConfig::new("model.gguf")
            .with_worker_count(3)
            .with_sync_timeout_ms(250);
        assert_eq!(config.context_size, DEFAULT_CONTEXT_SIZE);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.sync_timeout_ms, 250);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(ServiceConfig::new("m.gguf").with_worker_count(0).validate().is_err());
        assert!(ServiceConfig::new("m.gguf").with_context_size(0).validate().is_err());
        assert!(ServiceConfig::new("").validate().is_err());
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        assert!(ServiceConfig::from_file("service.toml").is_err());
    }
}
