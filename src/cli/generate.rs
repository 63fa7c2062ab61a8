//! One-shot blocking generation command

use std::path::Path;

use anyhow::Result;

use crate::config::ServiceConfig;
use crate::engine::llama::LlamaEngine;
use crate::service::Service;

/// Load `config_path`, run one `generate_sync` request and print the result
///
/// The printed value is the generated text or one of the sentinels.
pub fn generate(
    config_path: &Path,
    prompt: &str,
    context: &str,
    max_tokens: Option<usize>,
) -> Result<()> {
    let config = ServiceConfig::from_file(config_path)?;
    let max_tokens = max_tokens.unwrap_or(config.generation.max_tokens);

    let service = Service::new(LlamaEngine::init()?);
    service.initialize(config)?;

    let output = service.generate_sync(prompt, max_tokens, context);
    println!("{}", output);

    service.shutdown();
    Ok(())
}
