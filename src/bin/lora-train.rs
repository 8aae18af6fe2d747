//! LoRA fine-tuning CLI.
//!
//! Fine-tunes low-rank adapters on a frozen base checkpoint from a JSONL
//! file of prompt/response records:
//!
//! ```json
//! {"agent": "coffee-agent", "question": "what the best coffee?", "answer": "Arabica from Bolivia"}
//! ```
//!
//! The base checkpoint directory must hold `config.json`,
//! `model.safetensors`, and `tokenizer.json`. Checkpoints and the final
//! `adapter.safetensors` land under --output-dir.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::DType;
use clap::Parser;
use mediagen::train::dataset::Dataset;
use mediagen::train::lora::LoraConfig;
use mediagen::train::model::CausalLM;
use mediagen::train::{TrainConfig, train};
use tokenizers::Tokenizer;

#[derive(Parser, Debug)]
#[command(name = "lora-train", about = "Fine-tune LoRA adapters on prompt/response pairs")]
struct Args {
    /// JSONL file of training records.
    #[arg(long)]
    data: PathBuf,

    /// Base checkpoint directory.
    #[arg(long)]
    base_dir: PathBuf,

    /// Where checkpoints and the adapter are written.
    #[arg(long, default_value = "./helper-agent")]
    output_dir: PathBuf,

    /// LoRA rank.
    #[arg(long, default_value_t = 16)]
    rank: usize,

    /// LoRA alpha.
    #[arg(long, default_value_t = 32.0)]
    alpha: f64,

    /// LoRA dropout.
    #[arg(long, default_value_t = 0.1)]
    dropout: f32,

    /// Training epochs.
    #[arg(long, default_value_t = 5)]
    epochs: usize,

    /// Peak learning rate.
    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    /// Micro-batches accumulated per optimizer step.
    #[arg(long, default_value_t = 8)]
    grad_accum: usize,

    /// Maximum sequence length in tokens.
    #[arg(long, default_value_t = 512)]
    max_len: usize,

    /// Shuffle seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,
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

    let tokenizer = Tokenizer::from_file(args.base_dir.join("tokenizer.json"))
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

    let dataset = Dataset::from_jsonl(&args.data, &tokenizer, args.max_len)
        .context("failed to load training data")?;
    tracing::info!(examples = dataset.len(), "dataset ready");

    let lora_config = LoraConfig {
        rank: args.rank,
        alpha: args.alpha,
        dropout: args.dropout,
    };

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, base = %args.base_dir.display(), "loading base checkpoint");

    // Adapter tensors live in the VarMap; the base loads frozen.
    let varmap = candle_nn::VarMap::new();
    let adapter_vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = CausalLM::open_dir(&args.base_dir, Some((&lora_config, adapter_vb)), &device)
        .context("failed to load base model")?;
    tracing::info!(trainable = varmap.all_vars().len(), "adapters attached");

    let train_config = TrainConfig {
        epochs: args.epochs,
        learning_rate: args.learning_rate,
        grad_accum: args.grad_accum,
        max_len: args.max_len,
        seed: args.seed,
        ..TrainConfig::default()
    };

    let summary = train(&model, &varmap, &dataset, &train_config, &args.output_dir)
        .context("training failed")?;

    println!(
        r#"{{"adapter":"{path}","steps":{steps},"final_loss":{loss}}}"#,
        path = summary.adapter_path.display(),
        steps = summary.optimizer_steps,
        loss = summary.final_loss,
    );

    Ok(())
}
