//! Telegram bot that generates music from text prompts.
//!
//! `/start` explains the bot; any other text message is treated as a
//! prompt. The pipeline stays resident behind a worker; each prompt
//! becomes a timestamped MP3 under the files directory, sent back as a
//! document. The intermediate WAV is deleted after transcoding.
//!
//! If a file named exactly like the prompt already exists under the files
//! directory, it is sent as-is instead of generating (a crude cache for
//! repeated prompts; prompts with path separators never match).
//!
//! `BOT_TOKEN` must be set (a `.env` file is honored).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use mediagen::audiogen::{AudioGenerator, GeneratedAudio, MUSIC_REPO};
use mediagen::config::AudioParams;
use mediagen::telegram::{Bot, Message, next_offset};
use mediagen::worker::Worker;

const GREETING: &str = "Hi! Send me music prompt and I'll generate the sample";

#[derive(Parser, Debug)]
#[command(name = "music-bot", about = "Telegram bot for music generation")]
struct Args {
    /// Directory for generated files.
    #[arg(long, default_value = "./files")]
    files_dir: PathBuf,

    /// Request log (one line per generated prompt).
    #[arg(long, default_value = "server.log")]
    log_file: PathBuf,

    /// Clip duration in seconds.
    #[arg(long, default_value_t = 10.0)]
    duration: f64,

    /// Checkpoint repository.
    #[arg(long, default_value = MUSIC_REPO)]
    checkpoint: String,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, default_value_t = 0)]
    device: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenvy::dotenv();
    let token =
        std::env::var("BOT_TOKEN").context("BOT_TOKEN is not set in the environment or .env")?;

    let args = Args::parse();
    std::fs::create_dir_all(&args.files_dir)?;

    let checkpoint = args.checkpoint.clone();
    let device_ordinal = args.device;
    let duration = args.duration;
    let mut generator = tokio::task::spawn_blocking(move || {
        let device = mediagen::worker::preferred_device(device_ordinal);
        tracing::info!(?device, repo = %checkpoint, "loading text-to-audio pipeline");
        AudioGenerator::load(&checkpoint, &device)
    })
    .await?
    .context("failed to load pipeline")?;

    let worker: Worker<String, GeneratedAudio> = Worker::spawn(move |prompt: String| {
        let params = AudioParams {
            prompt,
            duration_s: duration,
            ..AudioParams::default()
        };
        generator.generate(&params)
    });

    let bot = Bot::new(&token);
    let username = bot.get_me().await.context("token check failed")?;
    tracing::info!(%username, "bot ready");

    let mut offset = 0i64;
    loop {
        let updates = match bot.get_updates(offset).await {
            Ok(updates) => updates,
            Err(error) => {
                tracing::warn!(%error, "poll cycle failed");
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                continue;
            }
        };
        offset = next_offset(&updates, offset);

        for update in updates {
            let Some(message) = update.message else {
                continue;
            };
            if let Err(error) = handle_message(&bot, &worker, &args, &message).await {
                tracing::error!(%error, chat = message.chat.id, "message handling failed");
                let _ = bot
                    .reply(
                        message.chat.id,
                        message.message_id,
                        &format!("Generation failed: {error}"),
                    )
                    .await;
            }
        }
    }
}

async fn handle_message(
    bot: &Bot,
    worker: &Worker<String, GeneratedAudio>,
    args: &Args,
    message: &Message,
) -> anyhow::Result<()> {
    let Some(text) = message.text.as_deref() else {
        return Ok(());
    };
    let prompt = text.trim().to_string();

    if prompt == "/start" {
        bot.reply(message.chat.id, message.message_id, GREETING).await?;
        return Ok(());
    }

    // Prompt-as-filename cache.
    if let Some(name) = mediagen::output::sanitize_component(&prompt) {
        let cached = args.files_dir.join(&name);
        if cached.is_file() {
            tracing::info!(path = %cached.display(), "serving cached file");
            bot.send_document(message.chat.id, &cached).await?;
            return Ok(());
        }
    }

    bot.reply(
        message.chat.id,
        message.message_id,
        "Got it, starting to generate...",
    )
    .await?;

    let wav_path = args.files_dir.join(mediagen::output::timestamp_name("wav"));
    let mp3_path = wav_path.with_extension("mp3");
    log_request(&args.log_file, &mp3_path, &prompt);
    tracing::info!(prompt = %prompt, output = %mp3_path.display(), "generating");

    let audio = worker.submit(prompt).await?;
    mediagen::audio::write_wav(&wav_path, &audio.samples, audio.sample_rate, audio.channels)?;
    mediagen::audio::write_mp3(&mp3_path, &audio.samples, audio.sample_rate, audio.channels)?;
    std::fs::remove_file(&wav_path)?;

    if !mp3_path.is_file() {
        bot.reply(
            message.chat.id,
            message.message_id,
            &format!("File {} not found", mp3_path.display()),
        )
        .await?;
        return Ok(());
    }

    bot.send_document(message.chat.id, &mp3_path).await?;
    tracing::info!(path = %mp3_path.display(), "sent");
    Ok(())
}

/// Append one request line to the log file, mirroring the server-side
/// prompt log the bot has always kept.
fn log_request(log_file: &Path, output: &Path, prompt: &str) {
    let line = format!(
        "[{}] {}: {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        output.display(),
        prompt
    );
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(error) = result {
        tracing::warn!(%error, "could not write request log");
    }
}
