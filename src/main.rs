use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infer_pool::cli::{Cli, Commands, RunOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infer_pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            model,
            prompt,
            context,
            max_tokens,
            workers,
            num_ctx,
            chat_template,
            temperature,
            gpu_layers,
        } => {
            infer_pool::cli::run(RunOptions {
                model,
                prompt,
                context,
                max_tokens,
                workers,
                num_ctx,
                chat_template,
                temperature,
                gpu_layers,
            })
            .await?;
        }
        Commands::Generate {
            config,
            prompt,
            context,
            max_tokens,
        } => {
            tokio::task::spawn_blocking(move || {
                infer_pool::cli::generate(&config, &prompt, &context, max_tokens)
            })
            .await??;
        }
    }

    Ok(())
}
