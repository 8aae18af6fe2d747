//! Instruction-guided image editing CLI.
//!
//! Loads an input image, applies a text instruction through the diffusion
//! img2img path, and writes the edited PNG next to it. The geometry of the
//! output follows --width/--height, not the input file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mediagen::config::EditParams;
use mediagen::diffusion::{DiffusionPipeline, SdVersion};

#[derive(Parser, Debug)]
#[command(name = "image-edit", about = "Edit an image with a text instruction")]
struct Args {
    /// Input image path.
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Edit instruction, e.g. "make it look like a watercolor painting".
    #[arg(long, short = 'p')]
    prompt: String,

    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Denoising steps over the full schedule.
    #[arg(long, default_value_t = 40)]
    steps: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.5)]
    guidance: f64,

    /// How strongly to move away from the input, in (0, 1].
    #[arg(long, default_value_t = 0.8)]
    strength: f64,

    /// Output width in pixels (multiple of 8).
    #[arg(long, default_value_t = 768)]
    width: usize,

    /// Output height in pixels (multiple of 8).
    #[arg(long, default_value_t = 768)]
    height: usize,

    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Checkpoint to use: v1-5 or v2-1.
    #[arg(long, default_value = "v2-1")]
    sd_version: String,

    /// Output file path. The name is probed upward if it already exists.
    #[arg(long, short = 'o', default_value = "edited.png")]
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

    let params = EditParams {
        prompt: args.prompt,
        negative_prompt: args.negative_prompt,
        steps: args.steps,
        guidance_scale: args.guidance,
        strength: args.strength,
        seed: args.seed,
    };
    params.validate()?;

    let input = mediagen::image::load_image(&args.input)
        .with_context(|| format!("failed to load {}", args.input.display()))?;

    mediagen::output::ensure_parent(&args.output)?;
    let output = mediagen::output::dedup_path(&args.output);

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, %version, "loading diffusion pipeline");
    let pipeline =
        DiffusionPipeline::load(version, args.width, args.height, &device, candle_core::DType::F32)
            .context("failed to load pipeline")?;

    tracing::info!(strength = params.strength, "editing image");
    let image = pipeline.edit(&input, &params).context("edit failed")?;
    mediagen::image::save_tensor_png(&image, &output).context("failed to write image")?;

    println!(
        r#"{{"path":"{path}","input":"{input}","strength":{strength}}}"#,
        path = output.display(),
        input = args.input.display(),
        strength = args.strength,
    );

    Ok(())
}
