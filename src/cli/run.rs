//! Streaming / interactive generation command

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use futures::StreamExt;

use crate::config::{GenerationConfig, ServiceConfig};
use crate::engine::llama::LlamaEngine;
use crate::service::Service;

/// Options for the `run` command
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub model: PathBuf,
    pub prompt: Option<String>,
    pub context: String,
    pub max_tokens: usize,
    pub workers: usize,
    pub num_ctx: u32,
    pub chat_template: Option<PathBuf>,
    pub temperature: f32,
    pub gpu_layers: u32,
}

/// Run generation, once for `--prompt` or in a read-eval loop otherwise
pub async fn run(options: RunOptions) -> Result<()> {
    let engine = LlamaEngine::init()?.with_gpu_layers(options.gpu_layers);
    let service = Service::new(engine);

    let mut config = ServiceConfig::new(&options.model)
        .with_context_size(options.num_ctx)
        .with_worker_count(options.workers)
        .with_generation(GenerationConfig {
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            ..Default::default()
        });
    if let Some(template) = &options.chat_template {
        config = config.with_chat_template(template);
    }

    // Model loading blocks; keep it off the async runtime
    let service = tokio::task::spawn_blocking(move || service.initialize(config).map(|_| service))
        .await??;
    tracing::info!("Model ready");

    if let Some(prompt) = options.prompt {
        generate_response(&service, &prompt, &options.context, options.max_tokens).await?;
        return Ok(());
    }

    // Interactive loop
    tracing::info!("Starting interactive session.");
    println!("Model: {}", options.model.display());
    println!("Type your prompt and press Enter. Type 'exit' or Ctrl+C to quit.\n");
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        if input == "exit" || input == "quit" {
            break;
        }

        generate_response(&service, input, &options.context, options.max_tokens).await?;
        println!();
    }

    tokio::task::spawn_blocking(move || service.shutdown()).await?;
    Ok(())
}

async fn generate_response(
    service: &Service<LlamaEngine>,
    prompt: &str,
    context: &str,
    max_tokens: usize,
) -> Result<()> {
    println!();

    let start = Instant::now();
    let mut token_count = 0usize;

    let stream = service.stream(prompt, context, max_tokens)?;
    let mut stream = std::pin::pin!(stream);

    while let Some(result) = stream.next().await {
        match result {
            Ok(piece) => {
                print!("{}", piece);
                io::stdout().flush()?;
                token_count += 1;
            }
            Err(e) => {
                eprintln!("\nError during generation: {}", e);
                break;
            }
        }
    }

    let elapsed = start.elapsed();
    let tok_per_sec = token_count as f64 / elapsed.as_secs_f64();

    println!();
    tracing::info!(
        "Generated {} tokens in {:.2}s ({:.1} tok/s)",
        token_count,
        elapsed.as_secs_f64(),
        tok_per_sec
    );
    Ok(())
}
