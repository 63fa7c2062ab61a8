//! CLI commands
//!
//! `run` for streaming / interactive generation, `generate` for a one-shot
//! blocking request driven by a config file.

mod generate;
mod run;

pub use generate::generate;
pub use run::{run, RunOptions};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{DEFAULT_CONTEXT_SIZE, DEFAULT_MAX_TOKENS, DEFAULT_WORKER_COUNT};

/// infer-pool - Concurrent LLM inference over a shared model
#[derive(Parser)]
#[command(name = "infer-pool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run generation with a model, interactively when no prompt is given
    Run {
        /// Path to a GGUF model
        model: PathBuf,

        /// Optional initial prompt
        #[arg(long, short)]
        prompt: Option<String>,

        /// Context placed before the prompt
        #[arg(long, short, default_value = "")]
        context: String,

        /// Maximum tokens to generate
        #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
        max_tokens: usize,

        /// Number of worker threads
        #[arg(long, default_value_t = DEFAULT_WORKER_COUNT)]
        workers: usize,

        /// Context window size per worker
        #[arg(long, default_value_t = DEFAULT_CONTEXT_SIZE)]
        num_ctx: u32,

        /// Chat template file
        #[arg(long)]
        chat_template: Option<PathBuf>,

        /// Sampling temperature (0 = greedy)
        #[arg(long, default_value = "0.8")]
        temperature: f32,

        /// Number of layers to offload to the GPU
        #[arg(long, default_value = "0")]
        gpu_layers: u32,
    },

    /// Generate text once using a YAML or JSON service config
    Generate {
        /// Service config file
        #[arg(long)]
        config: PathBuf,

        /// Prompt text
        #[arg(long, short)]
        prompt: String,

        /// Context placed before the prompt
        #[arg(long, short, default_value = "")]
        context: String,

        /// Maximum tokens to generate (defaults to the config's value)
        #[arg(long)]
        max_tokens: Option<usize>,
    },
}
