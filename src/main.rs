//! live-mic - stream microphone audio to a Gemini Live session.
//!
//! Captures fixed-size PCM frames from the default input device, forwards
//! them over a live duplex session, and records the model's streamed audio
//! replies to a WAV file while logging any text replies.

mod audio;
mod config;
mod driver;
mod session;
mod sink;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use audio::Capturer;
use config::AppConfig;
use driver::SessionDriver;
use session::{GeminiLiveSession, SessionConfig};
use sink::ResponseSink;

/// Wait for a shutdown signal (Ctrl+C or SIGTERM) and cancel the token.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fall back to the verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| if config.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })
        .unwrap();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎤 live-mic v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    config.log_config();

    let session_config = SessionConfig::audio(config.sample_rate, config.language.clone());
    let session = GeminiLiveSession::connect(&config.api_key, &config.model, session_config)
        .await
        .context("Failed to open live session")?;

    let sink = ResponseSink::open(&config.output, config.output_sample_rate)?;
    let (capturer, frames) = Capturer::start(config.sample_rate, config.frame_samples)?;

    info!("Recording from microphone... Press Ctrl+C to stop.");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    SessionDriver::new(Arc::new(session), sink).run(frames, capturer, shutdown).await?;

    info!("✅ Session finished");
    Ok(())
}
