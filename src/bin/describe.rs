//! Image description / question answering CLI.
//!
//! Asks Moondream2 one question about one image and prints the answer to
//! stdout. Without --question the model describes the image.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mediagen::config::VqaParams;
use mediagen::vqa::Moondream;

#[derive(Parser, Debug)]
#[command(name = "describe", about = "Ask a question about an image")]
struct Args {
    /// Image to look at.
    #[arg(long, short = 'i')]
    image: PathBuf,

    /// Question to ask about it.
    #[arg(long, short = 'q', default_value = "Describe this image.")]
    question: String,

    /// Maximum answer length in tokens.
    #[arg(long, default_value_t = 512)]
    max_tokens: usize,
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

    let image = mediagen::image::load_image(&args.image)
        .with_context(|| format!("failed to load {}", args.image.display()))?;

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, "loading moondream2");
    let mut moondream = Moondream::load(&device).context("failed to load model")?;

    let params = VqaParams {
        question: args.question,
        max_tokens: args.max_tokens,
    };
    let answer = moondream.answer(&image, &params).context("answering failed")?;
    println!("{answer}");

    Ok(())
}
