//! Generation configuration settings

use serde::{Deserialize, Serialize};

/// Default token budget for a single request
pub const DEFAULT_MAX_TOKENS: usize = 32;

/// Configuration for text generation
///
/// `max_tokens` is the default budget for callers that do not pass one; the
/// sampling fields configure every worker's sampler at session creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for sampling (higher = more random, 0 = greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-k sampling (0 = disabled)
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Top-p nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Random seed (None = random)
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_max_tokens() -> usize {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> u32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a greedy decoding config (temperature = 0)
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            ..Default::default()
        }
    }

    /// Check if greedy decoding should be used
    pub fn is_greedy(&self) -> bool {
        self.temperature <= f32::EPSILON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_tokens, 32);
        assert_eq!(config.top_k, 40);
        assert!(config.seed.is_none());
        assert!(!config.is_greedy());
    }

    #[test]
    fn test_greedy_preset() {
        let config = GenerationConfig::greedy();
        assert!(config.is_greedy());
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: GenerationConfig = serde_yaml::from_str("temperature: 0.2\nseed: 7\n").unwrap();
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.max_tokens, 32);
        assert_eq!(config.top_p, 0.95);
    }
}
