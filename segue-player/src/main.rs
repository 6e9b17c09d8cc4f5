//! Segue player - main entry point
//!
//! Loads the playlist and settings, assembles the pipeline, attaches the
//! audio device, and serves the HTTP control surface until shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use segue_common::Settings;
use segue_player::api::{create_router, AppContext};
use segue_player::audio::AudioOutput;
use segue_player::playlist::Playlist;
use segue_player::Player;

/// Command-line arguments for segue-player
#[derive(Parser, Debug)]
#[command(name = "segue-player")]
#[command(about = "Crossfading streaming player for track playlists")]
#[command(version)]
struct Args {
    /// Playlist file (JSON array of track descriptors)
    playlist: PathBuf,

    /// Config file path (defaults to the platform config dir)
    #[arg(short, long, env = "SEGUE_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the HTTP control surface
    #[arg(short, long, default_value = "5745", env = "SEGUE_PORT")]
    port: u16,

    /// Override the cache directory
    #[arg(long, env = "SEGUE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Audio output device name (default device when omitted)
    #[arg(long)]
    device: Option<String>,

    /// Seed for reproducible shuffle and clip selection
    #[arg(long)]
    seed: Option<u64>,

    /// Run without an audio device (control surface and pipeline only)
    #[arg(long)]
    no_audio: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segue_player=debug,segue_common=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut settings = Settings::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(cache_dir) = args.cache_dir {
        settings.cache_dir = cache_dir;
    }

    let playlist = Playlist::load(&args.playlist).context("Failed to load playlist")?;
    info!(
        "Starting segue-player: {} tracks, port {}",
        playlist.len(),
        args.port
    );

    let player = Player::new(settings.clone(), playlist, args.seed)
        .await
        .context("Failed to assemble pipeline")?;
    player.start();

    // Attach the audio device; the stream object is thread-bound and must
    // stay alive on this thread for the whole session
    let mut output = None;
    if !args.no_audio {
        let consumer = player
            .take_consumer()
            .context("Ring buffer consumer already taken")?;
        let mut device = AudioOutput::open(
            args.device.as_deref(),
            settings.sample_rate,
            settings.channels,
            player.state.volume_arc(),
        )
        .context("Failed to open audio device")?;
        device
            .start(consumer, settings.limiter_threshold)
            .context("Failed to start audio stream")?;
        output = Some(device);
    } else {
        warn!("Running without audio output (--no-audio)");
    }

    player
        .scheduler
        .play()
        .await
        .context("Failed to start playback")?;

    let ctx = AppContext {
        player: Arc::clone(&player),
    };
    let app = create_router(ctx);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!("Control surface listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind control-surface address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    player.shutdown().await;
    if let Some(mut device) = output {
        device.stop();
    }

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
