//! Audio capture module.
//!
//! Cross-platform microphone capture using cpal, emitting fixed-size
//! 16-bit PCM frames suitable for streaming to the live session.

mod capture;
pub mod util;

pub use capture::{AudioFrame, CaptureDevice, Capturer};
