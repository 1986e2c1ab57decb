//! Gemini Live wire protocol types.
//!
//! JSON messages exchanged over the BidiGenerateContent WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the WebSocket endpoint with the API key as a query parameter
//! 2. Send a `setup` message naming the model and session configuration
//! 3. Wait for `setupComplete`
//! 4. Stream audio via `realtimeInput.mediaChunks` (base64 PCM)
//! 5. Receive `serverContent` messages carrying text and/or inline audio parts
//! 6. Send `clientContent.turnComplete` to close the local speaker turn

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{InboundResponse, SessionConfig};

/// Gemini Live API WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

// ============================================================================
// Client messages (sent TO the model)
// ============================================================================

/// Messages sent from client to the Live API. Externally tagged, so each
/// serializes as a single-key object like `{"setup": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<super::Modality>,
    pub audio_in_config: AudioInConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInConfig {
    pub sample_rate_hz: u32,
    pub language_code: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64-encoded 16-bit little-endian PCM.
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turn_complete: bool,
}

impl ClientMessage {
    /// Create the connect-time setup message.
    pub fn setup(model: &str, config: &SessionConfig) -> Self {
        Self::Setup(SetupPayload {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: config.response_modalities.clone(),
                audio_in_config: AudioInConfig {
                    sample_rate_hz: config.input_sample_rate_hz,
                    language_code: config.language_code.clone(),
                },
            },
        })
    }

    /// Create an audio chunk message from raw PCM bytes.
    pub fn audio_chunk(pcm: &[u8], sample_rate_hz: u32) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: format!("audio/pcm;rate={}", sample_rate_hz),
                data: STANDARD.encode(pcm),
            }],
        })
    }

    /// Create the end-of-turn message.
    pub fn turn_complete() -> Self {
        Self::ClientContent(ClientContent { turn_complete: true })
    }
}

// ============================================================================
// Server messages (received FROM the model)
// ============================================================================

/// A frame from the model.
///
/// Parsed as a struct of optional sections rather than a tagged enum so that
/// unknown message kinds deserialize to an empty value instead of failing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<SetupComplete>,
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupComplete {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelTurn {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineData {
    pub mime_type: String,
    /// Base64-encoded 16-bit little-endian PCM.
    pub data: String,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten one server frame into the responses it carries.
    ///
    /// Frames with no recognized payload (turn boundaries, interruptions,
    /// future message kinds) yield a single `Other` so the inbound sequence
    /// still observes them.
    pub fn into_responses(self) -> Vec<InboundResponse> {
        let mut out = Vec::new();

        if let Some(content) = self.server_content
            && let Some(turn) = content.model_turn
        {
            for part in turn.parts {
                if let Some(text) = part.text {
                    out.push(InboundResponse::Text(text));
                }
                if let Some(blob) = part.inline_data {
                    match STANDARD.decode(&blob.data) {
                        Ok(pcm) => out.push(InboundResponse::Audio(pcm)),
                        Err(e) => warn!("Discarding undecodable audio part ({}): {}", blob.mime_type, e),
                    }
                }
            }
        }

        if out.is_empty() {
            out.push(InboundResponse::Other);
        }
        out
    }
}
