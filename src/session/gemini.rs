//! Gemini Live WebSocket session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Open the WebSocket, send `setup`, wait for `setupComplete`
//! 2. A background task parses inbound frames into [`InboundResponse`] values
//! 3. `send_audio()` / `next_response()` run concurrently over the split socket
//! 4. `close()` - Send a close frame, best-effort
//!
//! Mid-session disconnects do not reconnect; the driver treats them as fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, GEMINI_LIVE_URL, ServerMessage};
use super::{InboundResponse, LiveSession, SessionConfig, SessionError};

/// Timeout for the initial WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the setup/setupComplete exchange.
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound channel depth between the reader task and `next_response`.
const INBOUND_CHANNEL_DEPTH: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A live duplex session with a Gemini model.
pub struct GeminiLiveSession {
    writer: Mutex<WsSink>,
    inbound: Mutex<mpsc::Receiver<Result<InboundResponse, SessionError>>>,
    closed: Arc<AtomicBool>,
    input_sample_rate_hz: u32,
    reader_task: JoinHandle<()>,
}

impl GeminiLiveSession {
    /// Connect to the Live API and complete the setup handshake.
    ///
    /// # Errors
    /// Returns [`SessionError::ConnectFailed`] if the socket cannot be opened
    /// or the handshake times out, [`SessionError::Protocol`] if the server
    /// answers with something other than `setupComplete`.
    pub async fn connect(api_key: &str, model: &str, config: SessionConfig) -> Result<Self, SessionError> {
        let url = format!("{}?key={}", GEMINI_LIVE_URL, api_key);

        info!("Connecting to Gemini Live ({})...", model);

        let (ws_stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| SessionError::ConnectFailed("connection timeout".to_string()))?
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        let (mut writer, mut reader) = ws_stream.split();

        let setup = ClientMessage::setup(model, &config);
        let json = serde_json::to_string(&setup).map_err(|e| SessionError::Protocol(e.to_string()))?;
        writer.send(Message::Text(json)).await.map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        wait_for_setup_complete(&mut reader).await?;
        info!("Session established");

        let closed = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        let reader_task = spawn_reader(reader, inbound_tx, closed.clone());

        Ok(Self {
            writer: Mutex::new(writer),
            inbound: Mutex::new(inbound_rx),
            closed,
            input_sample_rate_hz: config.input_sample_rate_hz,
            reader_task,
        })
    }

    async fn send_message(&self, msg: &ClientMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(msg).map_err(|e| SessionError::Protocol(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(json)).await.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed | tokio_tungstenite::tungstenite::Error::AlreadyClosed => SessionError::Closed,
            other => SessionError::Transport(other.to_string()),
        })
    }
}

#[async_trait::async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_audio(&self, pcm: Vec<u8>, end_of_turn: bool) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SessionError::Closed);
        }

        if !pcm.is_empty() {
            self.send_message(&ClientMessage::audio_chunk(&pcm, self.input_sample_rate_hz)).await?;
        }
        if end_of_turn {
            self.send_message(&ClientMessage::turn_complete()).await?;
        }
        Ok(())
    }

    async fn next_response(&self) -> Result<Option<InboundResponse>, SessionError> {
        let mut inbound = self.inbound.lock().await;
        // Channel end means the reader task finished: a clean remote close
        inbound.recv().await.transpose()
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing session");
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("WebSocket close failed (likely already closed): {}", e);
        }
        Ok(())
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Read frames until the server acknowledges the setup message.
async fn wait_for_setup_complete(reader: &mut WsSource) -> Result<(), SessionError> {
    timeout(SETUP_TIMEOUT, async {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if parse_server_message(text.as_bytes())?.is_setup_complete() {
                        return Ok(());
                    }
                    debug!("Ignoring message while waiting for setupComplete");
                }
                Ok(Message::Binary(data)) => {
                    if parse_server_message(&data)?.is_setup_complete() {
                        return Ok(());
                    }
                    debug!("Ignoring message while waiting for setupComplete");
                }
                Ok(Message::Close(_)) => {
                    return Err(SessionError::ConnectFailed("connection closed before setup completed".to_string()));
                }
                Ok(_) => {} // Ignore ping/pong
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            }
        }
        Err(SessionError::ConnectFailed("stream ended before setup completed".to_string()))
    })
    .await
    .map_err(|_| SessionError::ConnectFailed("setup timeout".to_string()))?
}

fn parse_server_message(raw: &[u8]) -> Result<ServerMessage, SessionError> {
    serde_json::from_slice(raw).map_err(|e| SessionError::Protocol(e.to_string()))
}

/// Spawn the background task that turns WebSocket frames into responses.
///
/// The task ends (dropping its sender) on a clean close; a transport failure
/// is forwarded as one final `Err` item first.
fn spawn_reader(mut reader: WsSource, inbound_tx: mpsc::Sender<Result<InboundResponse, SessionError>>, closed: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = reader.next().await {
            let raw: Vec<u8> = match frame {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => {
                    info!("Session closed by remote end");
                    break;
                }
                Ok(_) => continue, // Ignore ping/pong
                Err(e) => {
                    let _ = inbound_tx.send(Err(SessionError::Transport(e.to_string()))).await;
                    break;
                }
            };

            let msg: ServerMessage = match serde_json::from_slice(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Failed to parse server message: {}", e);
                    continue;
                }
            };

            for response in msg.into_responses() {
                if inbound_tx.send(Ok(response)).await.is_err() {
                    debug!("Inbound channel dropped, reader task exiting");
                    closed.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        debug!("Reader task exiting");
    })
}
