//! Local LLM text generation CLI.
//!
//! Runs one completion against a quantized GGUF checkpoint and prints it.
//! Two modes:
//!
//! - `--prompt "..."` — complete the prompt as-is
//! - `--docs-dir ./docs --question "..."` — concatenate every file in the
//!   directory as context and answer the question from it

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mediagen::config::TextGenParams;
use mediagen::textgen::{
    DEFAULT_GGUF_FILE, DEFAULT_GGUF_REPO, DEFAULT_TOKENIZER_REPO, TextGenerator, context_prompt,
};

#[derive(Parser, Debug)]
#[command(name = "text-gen", about = "Local LLM text generation")]
struct Args {
    /// Prompt to complete. Mutually exclusive with --docs-dir.
    #[arg(long, short = 'p', conflicts_with = "docs_dir")]
    prompt: Option<String>,

    /// Directory of text files to use as context.
    #[arg(long, requires = "question")]
    docs_dir: Option<PathBuf>,

    /// Question to answer from the context.
    #[arg(long, short = 'q')]
    question: Option<String>,

    /// Local GGUF file. Omit to download the default checkpoint.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Local tokenizer.json. Omit to download the default.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Maximum tokens to generate.
    #[arg(long, default_value_t = 512)]
    max_tokens: usize,

    /// Sampling temperature.
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,

    /// Nucleus sampling cutoff.
    #[arg(long, default_value_t = 0.95)]
    top_p: f64,

    /// Repeat penalty over the recent context.
    #[arg(long, default_value_t = 1.1)]
    repeat_penalty: f32,

    #[arg(long, short = 's')]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let prompt = match (&args.prompt, &args.docs_dir, &args.question) {
        (Some(prompt), _, _) => prompt.clone(),
        (None, Some(docs_dir), Some(question)) => {
            context_prompt(docs_dir, question).context("failed to read docs directory")?
        }
        _ => anyhow::bail!("either --prompt or --docs-dir with --question is required"),
    };

    let gguf = match &args.model {
        Some(path) => path.clone(),
        None => mediagen::hub::model_file(DEFAULT_GGUF_REPO, DEFAULT_GGUF_FILE)
            .context("failed to fetch checkpoint")?,
    };
    let tokenizer = match &args.tokenizer {
        Some(path) => path.clone(),
        None => mediagen::hub::model_file(DEFAULT_TOKENIZER_REPO, "tokenizer.json")
            .context("failed to fetch tokenizer")?,
    };

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, model = %gguf.display(), "loading model");
    let mut generator =
        TextGenerator::load(&gguf, &tokenizer, &device).context("failed to load model")?;

    let params = TextGenParams {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        top_p: Some(args.top_p),
        repeat_penalty: args.repeat_penalty,
        seed: args.seed,
        ..TextGenParams::default()
    };

    let completion = generator.complete(&prompt, &params).context("generation failed")?;
    println!("{completion}");

    Ok(())
}
