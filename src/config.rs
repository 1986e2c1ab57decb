//! Application configuration and CLI argument parsing.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Live microphone session configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "live-mic")]
#[command(author, version, about = "Stream microphone audio to a Gemini Live session", long_about = None)]
pub struct AppConfig {
    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Model to open the live session against
    #[arg(long, short = 'm', env = "GEMINI_MODEL", default_value = "models/gemini-2.0-flash-exp")]
    pub model: String,

    /// Language tag for the input audio
    #[arg(long, short = 'l', default_value = "en")]
    pub language: String,

    /// Output WAV file for the model's audio replies
    #[arg(long, short = 'o', default_value = "model_response.wav")]
    pub output: PathBuf,

    /// Microphone capture sample rate in Hz
    #[arg(long, default_value = "16000")]
    pub sample_rate: u32,

    /// Samples per capture frame
    #[arg(long, default_value = "1024")]
    pub frame_samples: usize,

    /// Sample rate of the model's audio output in Hz
    #[arg(long, default_value = "24000")]
    pub output_sample_rate: u32,

    /// Enable verbose (debug) logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("API key must not be empty (set GEMINI_API_KEY)");
        }
        if self.frame_samples == 0 {
            anyhow::bail!("Frame size must be at least one sample");
        }
        if self.sample_rate == 0 || self.output_sample_rate == 0 {
            anyhow::bail!("Sample rates must be non-zero");
        }
        Ok(())
    }

    /// Log the effective configuration at startup.
    pub fn log_config(&self) {
        info!("Model: {}", self.model);
        info!("Language: {}", self.language);
        info!("Capture: {} Hz, {} samples per frame", self.sample_rate, self.frame_samples);
        info!("Output: {} ({} Hz)", self.output.display(), self.output_sample_rate);
    }
}
