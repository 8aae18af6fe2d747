//! Image question-answering HTTP server.
//!
//! Serves `POST /` with multipart parts `image_file` and `question_string`,
//! authorized by `Authorization: Bearer $API_TOKEN`. The model stays
//! resident behind a worker queue; requests are answered sequentially.
//!
//! `API_TOKEN` must be set (a `.env` file is honored) — startup fails
//! without it.

use anyhow::Context;
use clap::Parser;
use mediagen::http::{AppState, VqaJob, answer_upload, router};
use mediagen::vqa::Moondream;
use mediagen::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "vqa-server", about = "HTTP endpoint for image question answering")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 5000)]
    port: u16,

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

    // Load .env before reading the token, same as the config it replaces.
    let _ = dotenvy::dotenv();
    let api_token =
        std::env::var("API_TOKEN").context("API_TOKEN is not set in the environment or .env")?;

    let args = Args::parse();

    // Bind first so callers can connect while the model loads; their
    // requests queue in the worker channel.
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening (loading model...)");

    let device_ordinal = args.device;
    let mut moondream = tokio::task::spawn_blocking(move || {
        let device = mediagen::worker::preferred_device(device_ordinal);
        tracing::info!(?device, "loading moondream2");
        Moondream::load(&device)
    })
    .await?
    .context("failed to load model")?;

    let worker = Worker::spawn(move |job: VqaJob| answer_upload(&mut moondream, job));
    let app = router(AppState::new(worker, api_token));

    tracing::info!("model ready");
    axum::serve(listener, app).await?;

    Ok(())
}
