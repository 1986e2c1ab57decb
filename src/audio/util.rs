//! Shared audio utilities for device selection and sample conversion.

use anyhow::Result;
use cpal::traits::DeviceTrait;
use cpal::{Device, SampleFormat, SupportedStreamConfig, SupportedStreamConfigRange};

/// Get a human-readable device name.
pub fn get_device_name(device: &Device) -> String {
    device.description().ok().map(|desc| desc.name().to_string()).unwrap_or_else(|| "Unknown".to_string())
}

/// Find an input configuration that captures at exactly the target rate.
///
/// Only mono/stereo F32 configurations are considered (universally supported
/// on modern hardware). There is no resampler in this pipeline, so a device
/// that cannot do the exact rate is an error; the message names the closest
/// rate the device does support.
pub fn find_input_config(configs: impl Iterator<Item = SupportedStreamConfigRange>, target_sample_rate: u32) -> Result<SupportedStreamConfig> {
    let f32_configs: Vec<SupportedStreamConfigRange> = configs.filter(|c| c.channels() <= 2 && c.sample_format() == SampleFormat::F32).collect();

    if f32_configs.is_empty() {
        anyhow::bail!("No F32 audio configuration found - this is unexpected on modern hardware");
    }

    for config in &f32_configs {
        if target_sample_rate >= config.min_sample_rate() && target_sample_rate <= config.max_sample_rate() {
            return Ok((*config).with_sample_rate(target_sample_rate));
        }
    }

    let closest = closest_supported_rate(f32_configs.iter().map(|c| (c.min_sample_rate(), c.max_sample_rate())), target_sample_rate);
    anyhow::bail!("Input device cannot capture at {} Hz (closest supported: {} Hz)", target_sample_rate, closest)
}

/// Pick the supported rate nearest to `target` across `(min, max)` ranges.
fn closest_supported_rate(ranges: impl Iterator<Item = (u32, u32)>, target: u32) -> u32 {
    ranges.map(|(min, max)| target.clamp(min, max)).min_by_key(|rate| rate.abs_diff(target)).unwrap_or(target)
}

/// Downmix interleaved f32 samples to mono.
///
/// Mono input is copied through, stereo is averaged per frame.
pub fn convert_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        data.to_vec()
    } else {
        data.chunks(channels).map(|frame| frame.iter().sum::<f32>() / channels as f32).collect()
    }
}

/// Convert a normalized f32 sample to signed 16-bit PCM, clamping out-of-range values.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
