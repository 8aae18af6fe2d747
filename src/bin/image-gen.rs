//! Text-to-image CLI.
//!
//! Generates one PNG from a text prompt. Downloads the diffusion
//! checkpoint from HuggingFace on first run.
//!
//! # Output
//!
//! Never overwrites: the output path gets a `-1`, `-2`, … suffix when
//! taken. A one-line JSON summary goes to stdout on success:
//!
//! ```json
//! {"path":"image.png","width":768,"height":768,"steps":50,"seed":42}
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mediagen::config::ImageParams;
use mediagen::diffusion::{DiffusionPipeline, SdVersion};

#[derive(Parser, Debug)]
#[command(name = "image-gen", about = "Diffusion text-to-image generation")]
struct Args {
    /// Text description of the image.
    #[arg(long, short = 'p')]
    prompt: String,

    /// Things the image should not contain.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Output width in pixels (multiple of 8).
    #[arg(long, default_value_t = 768)]
    width: usize,

    /// Output height in pixels (multiple of 8).
    #[arg(long, default_value_t = 768)]
    height: usize,

    /// Denoising steps.
    #[arg(long, default_value_t = 50)]
    steps: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.5)]
    guidance: f64,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Checkpoint to use: v1-5 or v2-1.
    #[arg(long, default_value = "v2-1")]
    sd_version: String,

    /// Output file path. The name is probed upward if it already exists.
    #[arg(long, short = 'o', default_value = "image.png")]
    output: PathBuf,
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
    let version: SdVersion = args.sd_version.parse()?;

    let params = ImageParams {
        prompt: args.prompt,
        negative_prompt: args.negative_prompt,
        width: args.width,
        height: args.height,
        steps: args.steps,
        guidance_scale: args.guidance,
        seed: args.seed,
    };
    params.validate()?;

    mediagen::output::ensure_parent(&args.output)?;
    let output = mediagen::output::dedup_path(&args.output);

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, %version, "loading diffusion pipeline");
    let pipeline =
        DiffusionPipeline::load(version, args.width, args.height, &device, candle_core::DType::F32)
            .context("failed to load pipeline")?;

    tracing::info!(steps = params.steps, "generating image");
    let image = pipeline.generate(&params).context("generation failed")?;
    mediagen::image::save_tensor_png(&image, &output).context("failed to write image")?;

    println!(
        r#"{{"path":"{path}","width":{width},"height":{height},"steps":{steps},"seed":{seed}}}"#,
        path = output.display(),
        width = args.width,
        height = args.height,
        steps = args.steps,
        seed = args.seed.map_or("null".to_string(), |s| s.to_string()),
    );

    Ok(())
}
