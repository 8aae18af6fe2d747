//! Text-to-audio CLI.
//!
//! Generates one clip from a text prompt — music by default, sound effects
//! with --sound. Downloads the checkpoint from HuggingFace on first run.
//!
//! # Output
//!
//! A WAV file (or MP3 with the `audio-mp3` feature), name probed upward if
//! taken, plus a one-line JSON summary on stdout:
//!
//! ```json
//! {"path":"audiogen.wav","duration_s":10.0,"sample_rate":32000,"channels":1}
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mediagen::audiogen::{AudioGenerator, MUSIC_REPO, SOUND_REPO};
use mediagen::config::AudioParams;

#[derive(Parser, Debug)]
#[command(name = "audio-gen", about = "Text-to-audio generation (music and sound)")]
struct Args {
    /// Text description of the clip.
    #[arg(long, short = 'p')]
    prompt: String,

    /// Duration in seconds (1–120).
    #[arg(long, short = 'd', default_value_t = 10.0)]
    duration: f64,

    /// Sampling temperature.
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// Top-k sampling cutoff.
    #[arg(long, default_value_t = 250)]
    top_k: usize,

    /// Guidance over the empty-text condition. <= 1 disables it.
    #[arg(long, default_value_t = 3.0)]
    guidance: f64,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Generate sound effects instead of music.
    #[arg(long, default_value_t = false)]
    sound: bool,

    /// Override the checkpoint repository.
    #[arg(long)]
    checkpoint: Option<String>,

    /// Output file path (.wav, or .mp3 with the audio-mp3 feature).
    #[arg(long, short = 'o', default_value = "audiogen.wav")]
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

    let ext = args
        .output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav");
    if mediagen::audio::AudioFormat::parse(ext).is_none() {
        anyhow::bail!("unsupported output format '{ext}'");
    }

    let params = AudioParams {
        prompt: args.prompt,
        duration_s: args.duration,
        temperature: args.temperature,
        top_k: args.top_k,
        guidance_scale: args.guidance,
        seed: args.seed,
    };
    params.validate()?;

    mediagen::output::ensure_parent(&args.output)?;
    let output = mediagen::output::dedup_path(&args.output);

    let repo = args.checkpoint.unwrap_or_else(|| {
        if args.sound { SOUND_REPO } else { MUSIC_REPO }.to_string()
    });

    let device = mediagen::worker::preferred_device(0);
    tracing::info!(?device, %repo, "loading text-to-audio pipeline");
    let mut generator = AudioGenerator::load(&repo, &device).context("failed to load pipeline")?;

    tracing::info!(duration_s = params.duration_s, "generating audio");
    let audio = generator.generate(&params).context("generation failed")?;

    mediagen::audio::write_audio(&output, &audio.samples, audio.sample_rate, audio.channels)
        .context("failed to write audio")?;

    let duration =
        mediagen::audio::duration_s(audio.samples.len(), audio.sample_rate, audio.channels);
    println!(
        r#"{{"path":"{path}","duration_s":{duration},"sample_rate":{sr},"channels":{ch}}}"#,
        path = output.display(),
        sr = audio.sample_rate,
        ch = audio.channels,
    );

    Ok(())
}
