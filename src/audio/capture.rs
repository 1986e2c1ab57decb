//! Microphone capture using cpal.
//!
//! The cpal callback pushes converted samples into a lock-free ring buffer so
//! it never blocks. A frame-assembly thread drains the ring and emits
//! fixed-size 16-bit PCM frames over a bounded channel for the outbound pump.
//!
//! The cpal stream is not `Send`, so it lives on a dedicated thread for its
//! whole life; releasing the device signals that thread to stop and close the
//! stream before the assembly thread is joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::util::{convert_to_mono, f32_to_i16, find_input_config, get_device_name};

/// Ring buffer capacity: 65536 samples = ~4 seconds at 16kHz.
const RING_CAPACITY: usize = 65536;

/// Bounded frame channel depth (32 frames ~= 2 seconds at 1024 samples / 16kHz).
const FRAME_CHANNEL_DEPTH: usize = 32;

/// One fixed-size block of raw 16-bit little-endian PCM captured from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Vec<u8>);

impl AudioFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        Self(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A capture device handle whose release is idempotent.
///
/// The outbound pump owns the device for the streaming phase and releases it
/// during its cleanup, after the final end-of-turn send.
pub trait CaptureDevice: Send + 'static {
    /// Stop capturing and free the device. Safe to call more than once;
    /// only the first call does anything.
    fn release(&mut self);
}

/// Microphone capturer streaming fixed-size PCM frames.
///
/// Holds no cpal state directly; the stream lives on `stream_thread` and is
/// torn down through `stop_tx`.
pub struct Capturer {
    released: Arc<AtomicBool>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    stream_thread: Option<JoinHandle<()>>,
    assembly_thread: Option<JoinHandle<()>>,
}

impl Capturer {
    /// Open the default input device and start capturing.
    ///
    /// # Arguments
    /// * `sample_rate` - Capture sample rate (16000 for the live session)
    /// * `frame_samples` - Samples per emitted frame (1024 nominal)
    ///
    /// # Returns
    /// The capturer handle and the receiving end of the frame channel.
    ///
    /// # Errors
    /// Returns an error if no input device is available, the device cannot
    /// capture at `sample_rate`, or the stream fails to start.
    pub fn start(sample_rate: u32, frame_samples: usize) -> Result<(Self, mpsc::Receiver<AudioFrame>)> {
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_DEPTH);

        let released = Arc::new(AtomicBool::new(false));

        // Lock-free ring between the cpal callback and the assembly thread
        let ring = HeapRb::<i16>::new(RING_CAPACITY);
        let (producer, mut consumer) = ring.split();

        // stop_tx is dropped on release; recv() in the stream thread wakes up
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let released_cb = released.clone();
        let stream_thread = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, released_cb, producer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(anyhow::Error::new(e).context("Failed to start audio stream")));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until release drops the sender, then stop and close
                let _ = stop_rx.recv();
                if let Err(e) = stream.pause() {
                    warn!("Failed to stop input stream: {}", e);
                }
                drop(stream);
                debug!("Input stream closed");
            })
            .context("Failed to spawn capture thread")?;

        ready_rx.recv().context("Capture thread exited before the stream was ready")??;

        let assembly_released = released.clone();
        let assembly_thread = std::thread::Builder::new()
            .name("frame-assembly".into())
            .spawn(move || {
                let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);
                let mut scratch = vec![0i16; frame_samples];

                loop {
                    if assembly_released.load(Ordering::Relaxed) {
                        debug!("Frame assembly thread shutting down");
                        return;
                    }

                    let available = consumer.occupied_len();
                    if available == 0 {
                        // Brief sleep keeps latency low without busy-waiting
                        std::thread::sleep(Duration::from_micros(100));
                        continue;
                    }

                    let to_read = available.min(scratch.len());
                    let read = consumer.pop_slice(&mut scratch[..to_read]);
                    pending.extend_from_slice(&scratch[..read]);

                    while pending.len() >= frame_samples {
                        let samples: Vec<i16> = pending.drain(..frame_samples).collect();
                        if frame_tx.blocking_send(AudioFrame::from_samples(&samples)).is_err() {
                            debug!("Frame channel closed, assembly thread exiting");
                            return;
                        }
                    }
                }
            })
            .context("Failed to spawn frame assembly thread")?;

        info!("Audio capture started: {} Hz, {} samples per frame", sample_rate, frame_samples);

        Ok((
            Self {
                released,
                stop_tx: Some(stop_tx),
                stream_thread: Some(stream_thread),
                assembly_thread: Some(assembly_thread),
            },
            frame_rx,
        ))
    }
}

impl CaptureDevice for Capturer {
    fn release(&mut self) {
        // First caller wins; repeated release is a no-op
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        // Stop: wake the stream thread so it pauses and closes the stream
        drop(self.stop_tx.take());
        if let Some(handle) = self.stream_thread.take()
            && handle.join().is_err()
        {
            warn!("Capture thread panicked during shutdown");
        }

        // Terminate: the assembly thread sees the released flag and exits
        if let Some(handle) = self.assembly_thread.take()
            && handle.join().is_err()
        {
            warn!("Frame assembly thread panicked during shutdown");
        }

        info!("Microphone released");
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the cpal input stream feeding the ring buffer.
fn build_input_stream(sample_rate: u32, released: Arc<AtomicBool>, mut producer: ringbuf::HeapProd<i16>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host.default_input_device().context("No input device available")?;

    info!("Using input device: {}", get_device_name(&device));

    let supported_configs = device.supported_input_configs().context("Failed to get supported input configs")?;
    let config = find_input_config(supported_configs, sample_rate)?;

    let channels = config.channels() as usize;
    debug!("Audio capture config: {} Hz, {} channels, {:?}", config.sample_rate(), config.channels(), config.sample_format());

    let stream_config: StreamConfig = config.config();

    let err_fn = |err| {
        error!("Audio capture error: {}", err);
    };

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if released.load(Ordering::Relaxed) {
                return;
            }

            let mono = convert_to_mono(data, channels);
            let samples: Vec<i16> = mono.iter().map(|&s| f32_to_i16(s)).collect();

            // Push to ring buffer (lock-free, non-blocking); overflow is
            // tolerated by dropping samples, with a rate-limited warning
            let written = producer.push_slice(&samples);
            if written < samples.len() {
                use std::sync::atomic::AtomicU64;
                static DROP_COUNT: AtomicU64 = AtomicU64::new(0);
                let count = DROP_COUNT.fetch_add(1, Ordering::Relaxed);
                if count.is_multiple_of(100) {
                    warn!("Ring buffer full, dropped {} audio chunks", count + 1);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
