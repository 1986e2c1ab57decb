//! Live session capability.
//!
//! A [`LiveSession`] is a duplex channel to a generative model: audio frames
//! go out, a lazy sequence of [`InboundResponse`] values comes back. The
//! concrete transport lives in [`gemini`]; the driver and the outbound pump
//! only ever see the trait.

mod gemini;
pub mod protocol;

pub use gemini::GeminiLiveSession;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Errors from the session transport.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The session has been closed (locally or by the remote end).
    /// Distinct from [`SessionError::Transport`]: a clean close is not a failure.
    #[error("session closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One value from the session's inbound sequence.
///
/// Carries at most one payload. Signals the driver does not understand map to
/// [`InboundResponse::Other`] and are dropped, never treated as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundResponse {
    /// A text fragment from the model.
    Text(String),
    /// Raw 16-bit PCM audio from the model.
    Audio(Vec<u8>),
    /// Any other signal (setup acks, turn boundaries, future additions).
    Other,
}

/// Response modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Session configuration sent during the connect handshake.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Modalities the model may respond with.
    pub response_modalities: Vec<Modality>,
    /// Sample rate of the audio we send (Hz).
    pub input_sample_rate_hz: u32,
    /// BCP-47 language tag for the input audio.
    pub language_code: String,
}

impl SessionConfig {
    /// Audio-out configuration for microphone input at the given rate.
    pub fn audio(input_sample_rate_hz: u32, language_code: impl Into<String>) -> Self {
        Self {
            response_modalities: vec![Modality::Audio],
            input_sample_rate_hz,
            language_code: language_code.into(),
        }
    }
}

/// A live duplex channel to the model.
///
/// Shared by the outbound pump (send side) and the driver (receive side) for
/// the duration of one connection. Neither side reconfigures the session
/// after connect.
#[async_trait]
pub trait LiveSession: Send + Sync + 'static {
    /// Forward one chunk of 16-bit little-endian PCM to the model.
    ///
    /// `end_of_turn = false` signals more audio from this speaker turn is
    /// coming; `end_of_turn = true` (typically with an empty payload) closes
    /// the turn so the model can respond.
    async fn send_audio(&self, pcm: Vec<u8>, end_of_turn: bool) -> Result<(), SessionError>;

    /// Wait for the next inbound response.
    ///
    /// Returns `Ok(None)` when the remote end closed the session cleanly;
    /// transport failures surface as `Err`. The sequence is not restartable.
    async fn next_response(&self) -> Result<Option<InboundResponse>, SessionError>;

    /// Close the session. Best-effort; safe to call after a remote close.
    async fn close(&self) -> Result<(), SessionError>;
}
