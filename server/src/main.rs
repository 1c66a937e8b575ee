//! Opuscast server entry point.
//!
//! Loads configuration from the environment (optionally seeded from an
//! env file), wires up the broadcast engine, and serves the HTTP surface
//! until the process is terminated.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use opuscast_common::{init_tracing, ColorWhen};
use opuscast_server::config::{self, Config};
use opuscast_server::engine::Engine;
use opuscast_server::http;

/// Synchronized always-on internet radio server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Env file loaded before reading configuration
    #[arg(long, default_value = config::DEFAULT_ENV_FILE)]
    env_file: String,

    /// ANSI color policy for log output (auto|always|never)
    #[arg(long, default_value = "auto")]
    color: ColorWhen,

    /// Override the media directory (else MEDIA_DIR or "media")
    #[arg(long)]
    media_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    config::load_env_file(&args.env_file)?;

    init_tracing(args.color)?;

    let mut cfg = Config::from_env().context("read configuration")?;
    if let Some(media_dir) = args.media_dir {
        cfg.media_dir = media_dir;
    }

    if !cfg.disable_frontend && !cfg.frontend_dir.join("index.html").is_file() {
        anyhow::bail!(
            "frontend build missing at {} (build the web UI or set DISABLE_FRONTEND)",
            cfg.frontend_dir.display()
        );
    }

    info!("Starting opuscast server");
    info!("Media dir: {}", cfg.media_dir.display());
    info!("HLS output dir: {}", cfg.hls_output_dir.display());

    let engine = Engine::new(cfg).await.context("build broadcast engine")?;
    Engine::start(&engine).context("start broadcast engine")?;

    let result = http::serve(Arc::clone(&engine)).await;

    engine.shutdown();
    result
}
