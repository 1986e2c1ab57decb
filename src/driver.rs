//! Session driver.
//!
//! Owns one complete interaction lifecycle over a [`LiveSession`]: the
//! outbound pump forwards captured frames while the driver consumes the
//! inbound response sequence, dispatching text to the log and audio to the
//! [`ResponseSink`].
//!
//! The driver moves through `Connecting → Streaming → Draining → Closed`.
//! Draining runs the same way on remote stream-end, local cancellation, and
//! inbound failure: the pump is cancelled, its cleanup (final end-of-turn
//! send, device release) is awaited, and only then are the session and sink
//! released.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioFrame, CaptureDevice};
use crate::session::{InboundResponse, LiveSession, SessionError};
use crate::sink::ResponseSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Connecting,
    Streaming,
    Draining,
    Closed,
}

pub struct SessionDriver<S: LiveSession> {
    session: Arc<S>,
    sink: ResponseSink,
    state: DriverState,
}

impl<S: LiveSession> SessionDriver<S> {
    /// Create a driver for an already-connected session.
    pub fn new(session: Arc<S>, sink: ResponseSink) -> Self {
        Self {
            session,
            sink,
            state: DriverState::Connecting,
        }
    }

    /// Run one interaction lifecycle to completion.
    ///
    /// Returns when the inbound sequence ends, `shutdown` fires, or a failure
    /// occurs. In every case the outbound pump's cleanup has fully run and the
    /// sink is finalized before this returns; the first failure encountered is
    /// propagated.
    pub async fn run<D: CaptureDevice>(mut self, frames: mpsc::Receiver<AudioFrame>, device: D, shutdown: CancellationToken) -> Result<()> {
        self.transition(DriverState::Streaming);

        let outbound_token = shutdown.child_token();
        let outbound = tokio::spawn(pump_frames(Arc::clone(&self.session), frames, device, outbound_token.clone()));

        let inbound_result = self.consume_responses(&shutdown).await;

        self.transition(DriverState::Draining);
        outbound_token.cancel();
        let outbound_result = match outbound.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("outbound pump panicked: {e}")),
        };

        self.transition(DriverState::Closed);
        if let Err(e) = self.session.close().await {
            warn!("Session close failed: {}", e);
        }
        let finalize_result = self.sink.finalize();

        inbound_result?;
        outbound_result?;
        finalize_result?;
        Ok(())
    }

    /// Consume the inbound response sequence until it ends or shutdown fires.
    async fn consume_responses(&mut self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let response = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, leaving response loop");
                    return Ok(());
                }
                response = self.session.next_response() => response,
            };

            match response {
                Ok(Some(InboundResponse::Text(text))) => info!("Model: {}", text),
                Ok(Some(InboundResponse::Audio(pcm))) => self.sink.append(&pcm)?,
                // Forward-compatibility: unknown signals are dropped, not errors
                Ok(Some(InboundResponse::Other)) => {}
                Ok(None) => {
                    info!("Inbound sequence ended");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn transition(&mut self, next: DriverState) {
        debug!("Driver state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Outbound pump: forward each captured frame to the session until cancelled.
///
/// Cancellation is absorbed here, not propagated. The cleanup path runs on
/// every exit: exactly one zero-length end-of-turn send (a no-op if the
/// session is already closed), then exactly one device release.
async fn pump_frames<S: LiveSession, D: CaptureDevice>(session: Arc<S>, mut frames: mpsc::Receiver<AudioFrame>, mut device: D, token: CancellationToken) -> Result<()> {
    let result: Result<(), SessionError> = async {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Outbound pump cancelled");
                    return Ok(());
                }
                frame = frames.recv() => match frame {
                    Some(frame) => session.send_audio(frame.into_bytes(), false).await?,
                    None => {
                        debug!("Frame channel closed");
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    // Tell the model the speaker turn is over. Best-effort: the remote end
    // may already have closed the session.
    match session.send_audio(Vec::new(), true).await {
        Ok(()) => debug!("End-of-turn sent"),
        Err(SessionError::Closed) => debug!("Session already closed, end-of-turn skipped"),
        Err(e) => warn!("End-of-turn send failed: {}", e),
    }

    // Close the frame channel before releasing: release() joins the capture
    // threads, and a full channel would otherwise leave the assembly thread
    // parked in blocking_send with nobody left to poll the receiver.
    drop(frames);
    device.release();
    result.map_err(anyhow::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use hound::WavReader;

    /// Scripted session: records every send, replays a fixed inbound sequence.
    struct MockSession {
        sent: StdMutex<Vec<(Vec<u8>, bool)>>,
        inbound: tokio::sync::Mutex<VecDeque<Result<InboundResponse, SessionError>>>,
        /// When true, an exhausted inbound queue blocks forever instead of
        /// ending the sequence (models a session kept open by the remote end).
        hold_open: bool,
    }

    impl MockSession {
        fn new(inbound: Vec<Result<InboundResponse, SessionError>>, hold_open: bool) -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                inbound: tokio::sync::Mutex::new(inbound.into()),
                hold_open,
            }
        }

        fn sent(&self) -> Vec<(Vec<u8>, bool)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LiveSession for MockSession {
        async fn send_audio(&self, pcm: Vec<u8>, end_of_turn: bool) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push((pcm, end_of_turn));
            Ok(())
        }

        async fn next_response(&self) -> Result<Option<InboundResponse>, SessionError> {
            let popped = self.inbound.lock().await.pop_front();
            match popped {
                Some(item) => item.map(Some),
                None if self.hold_open => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct FakeDevice {
        releases: Arc<AtomicUsize>,
    }

    impl CaptureDevice for FakeDevice {
        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_device() -> (FakeDevice, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        (FakeDevice { releases: releases.clone() }, releases)
    }

    fn open_sink(dir: &tempfile::TempDir) -> (ResponseSink, std::path::PathBuf) {
        let path = dir.path().join("response.wav");
        (ResponseSink::open(&path, 24000).unwrap(), path)
    }

    #[tokio::test]
    async fn test_text_is_logged_and_audio_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = open_sink(&dir);

        let session = Arc::new(MockSession::new(
            vec![
                Ok(InboundResponse::Text("hi".to_string())),
                Ok(InboundResponse::Audio(vec![0x01, 0x02])),
                Ok(InboundResponse::Audio(vec![0x03, 0x04])),
            ],
            false,
        ));
        let (_frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(8);
        drop(_frame_tx);
        let (device, releases) = fake_device();

        SessionDriver::new(session.clone(), sink)
            .run(frame_rx, device, CancellationToken::new())
            .await
            .unwrap();

        // Audio arrived byte-for-byte, in order; the text response never did
        let reader = WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![i16::from_le_bytes([0x01, 0x02]), i16::from_le_bytes([0x03, 0x04])]);

        // Only the end-of-turn cleanup send happened (no frames were captured)
        assert_eq!(session.sent(), vec![(Vec::new(), true)]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_after_frames_sends_one_end_of_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = open_sink(&dir);

        let session = Arc::new(MockSession::new(Vec::new(), true));
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(8);
        let (device, releases) = fake_device();
        let shutdown = CancellationToken::new();

        let driver = SessionDriver::new(session.clone(), sink);
        let handle = tokio::spawn(driver.run(frame_rx, device, shutdown.clone()));

        for i in 0..3u8 {
            frame_tx.send(AudioFrame::new(vec![i, i, i, i])).await.unwrap();
        }
        // Let the pump forward all three frames before cancelling
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        shutdown.cancel(); // repeated cancellation must not double anything

        handle.await.unwrap().unwrap();

        let sent = session.sent();
        assert_eq!(sent.len(), 4);
        for (i, (pcm, end_of_turn)) in sent.iter().take(3).enumerate() {
            assert_eq!(pcm, &vec![i as u8; 4]);
            assert!(!end_of_turn);
        }
        assert_eq!(sent[3], (Vec::new(), true));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_driver_waits_for_pump_cleanup_when_inbound_ends_first() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = open_sink(&dir);

        // Inbound sequence ends immediately while the pump is still live
        let session = Arc::new(MockSession::new(Vec::new(), false));
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(8);
        let (device, releases) = fake_device();

        SessionDriver::new(session.clone(), sink)
            .run(frame_rx, device, CancellationToken::new())
            .await
            .unwrap();
        drop(frame_tx);

        // run() must not have returned before the cleanup send and release
        assert_eq!(session.sent(), vec![(Vec::new(), true)]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_transport_error_is_fatal_but_still_drains() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = open_sink(&dir);

        let session = Arc::new(MockSession::new(
            vec![
                Ok(InboundResponse::Audio(vec![0x01, 0x02])),
                Err(SessionError::Transport("socket reset".to_string())),
            ],
            false,
        ));
        let (_frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(8);
        drop(_frame_tx);
        let (device, releases) = fake_device();

        let result = SessionDriver::new(session.clone(), sink).run(frame_rx, device, CancellationToken::new()).await;

        assert!(result.is_err());
        // Cleanup still ran on the failure path
        assert_eq!(session.sent(), vec![(Vec::new(), true)]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_signals_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, path) = open_sink(&dir);

        let session = Arc::new(MockSession::new(
            vec![
                Ok(InboundResponse::Other),
                Ok(InboundResponse::Audio(vec![0x05, 0x06])),
                Ok(InboundResponse::Other),
            ],
            false,
        ));
        let (_frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(8);
        drop(_frame_tx);
        let (device, _releases) = fake_device();

        SessionDriver::new(session, sink).run(frame_rx, device, CancellationToken::new()).await.unwrap();

        let reader = WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![i16::from_le_bytes([0x05, 0x06])]);
    }

    #[tokio::test]
    async fn test_release_completes_with_producer_blocked_on_full_channel() {
        // A session slow enough to apply backpressure: the bounded frame
        // channel fills and the producer thread parks in blocking_send,
        // exactly where the capture assembly thread sits under load.
        struct SlowSession {
            sent: StdMutex<Vec<(Vec<u8>, bool)>>,
        }

        #[async_trait]
        impl LiveSession for SlowSession {
            async fn send_audio(&self, pcm: Vec<u8>, end_of_turn: bool) -> Result<(), SessionError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.sent.lock().unwrap().push((pcm, end_of_turn));
                Ok(())
            }
            async fn next_response(&self) -> Result<Option<InboundResponse>, SessionError> {
                std::future::pending().await
            }
            async fn close(&self) -> Result<(), SessionError> {
                Ok(())
            }
        }

        // Like Capturer, release() joins the producer thread; the join can
        // only finish once the frame channel has been closed under it.
        struct JoiningDevice {
            producer: Option<std::thread::JoinHandle<()>>,
            releases: Arc<AtomicUsize>,
        }

        impl CaptureDevice for JoiningDevice {
            fn release(&mut self) {
                if let Some(handle) = self.producer.take() {
                    handle.join().unwrap();
                }
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = open_sink(&dir);

        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(2);
        let producer = std::thread::spawn(move || {
            while frame_tx.blocking_send(AudioFrame::new(vec![0; 4])).is_ok() {}
        });

        let releases = Arc::new(AtomicUsize::new(0));
        let device = JoiningDevice {
            producer: Some(producer),
            releases: releases.clone(),
        };
        let session = Arc::new(SlowSession { sent: StdMutex::new(Vec::new()) });
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(SessionDriver::new(session.clone(), sink).run(frame_rx, device, shutdown.clone()));

        // Give the channel time to fill behind the slow sends
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(4), handle)
            .await
            .expect("driver must complete after cancellation")
            .unwrap()
            .unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        let sent = session.sent.lock().unwrap().clone();
        assert_eq!(sent.last(), Some(&(Vec::new(), true)));
    }

    #[tokio::test]
    async fn test_end_of_turn_on_closed_session_is_a_noop() {
        // Session that rejects every send with Closed: the pump must still
        // finish cleanly and release the device.
        struct ClosedSession;

        #[async_trait]
        impl LiveSession for ClosedSession {
            async fn send_audio(&self, _pcm: Vec<u8>, _end_of_turn: bool) -> Result<(), SessionError> {
                Err(SessionError::Closed)
            }
            async fn next_response(&self) -> Result<Option<InboundResponse>, SessionError> {
                Ok(None)
            }
            async fn close(&self) -> Result<(), SessionError> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (sink, _path) = open_sink(&dir);
        let (_frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(8);
        drop(_frame_tx);
        let (device, releases) = fake_device();

        SessionDriver::new(Arc::new(ClosedSession), sink)
            .run(frame_rx, device, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
