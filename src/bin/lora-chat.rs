//! Interactive chat against a fine-tuned adapter.
//!
//! Loads the frozen base checkpoint plus a trained adapter and answers
//! questions from stdin in a loop. Type `exit` to quit.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use candle_core::DType;
use clap::Parser;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use mediagen::train::dataset::{chat_prompt, extract_answer};
use mediagen::train::lora::LoraConfig;
use mediagen::train::model::CausalLM;
use tokenizers::Tokenizer;

#[derive(Parser, Debug)]
#[command(name = "lora-chat", about = "Chat with a fine-tuned adapter")]
struct Args {
    /// Base checkpoint directory.
    #[arg(long)]
    base_dir: PathBuf,

    /// Trained adapter file (adapter.safetensors).
    #[arg(long)]
    adapter: PathBuf,

    /// Agent name baked into the prompt template.
    #[arg(long, default_value = "helper-agent")]
    agent: String,

    /// Maximum answer length in tokens.
    #[arg(long, default_value_t = 512)]
    max_tokens: usize,

    /// Sampling temperature.
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,

    /// Nucleus sampling cutoff.
    #[arg(long, default_value_t = 0.92)]
    top_p: f64,

    /// Top-k cutoff applied before top-p.
    #[arg(long, default_value_t = 50)]
    top_k: usize,

    /// Repeat penalty over the recent context.
    #[arg(long, default_value_t = 1.2)]
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

    let tokenizer = Tokenizer::from_file(args.base_dir.join("tokenizer.json"))
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, adapter = %args.adapter.display(), "loading model");

    let lora_config = LoraConfig::default();
    let adapter_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(
            &[args.adapter.clone()],
            DType::F32,
            &device,
        )?
    };
    let model = CausalLM::open_dir(&args.base_dir, Some((&lora_config, adapter_vb)), &device)
        .context("failed to load model")?;

    let eos_token = *tokenizer
        .get_vocab(true)
        .get("</s>")
        .context("no </s> token in vocab")?;

    println!("Agent ready! Ask your questions (type 'exit' to quit)");

    let stdin = std::io::stdin();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let mut question = String::new();
        if stdin.lock().read_line(&mut question)? == 0 {
            break;
        }
        let question = question.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") {
            println!("Bye!");
            break;
        }

        let prompt = chat_prompt(&args.agent, question);
        let prompt_ids = tokenizer
            .encode(prompt.as_str(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?
            .get_ids()
            .to_vec();

        let seed = args.seed.unwrap_or_else(rand::random);
        let mut sampler = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopKThenTopP {
                k: args.top_k,
                p: args.top_p,
                temperature: args.temperature,
            },
        );

        match model.generate(
            &prompt_ids,
            eos_token,
            args.max_tokens,
            &mut sampler,
            args.repeat_penalty,
            64,
        ) {
            Ok(ids) => {
                let text = tokenizer
                    .decode(&ids, true)
                    .map_err(|e| anyhow::anyhow!("decoding failed: {e}"))?;
                println!("\n{}", extract_answer(&text));
            }
            Err(error) => eprintln!("error: {error}"),
        }
    }

    Ok(())
}
