//! WAV response sink.
//!
//! Appends the model's raw PCM audio to a single mono 16-bit WAV file. The
//! sink is an owned resource: opened once before streaming starts and
//! finalized by the driver when the session closes, so the container header
//! is always left consistent.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, info};

pub struct ResponseSink {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    bytes_written: u64,
}

impl ResponseSink {
    /// Open the output container.
    ///
    /// Appends to an existing WAV at `path` when its format matches,
    /// otherwise creates a new file.
    ///
    /// # Arguments
    /// * `path` - Output file path
    /// * `sample_rate` - Sample rate of the model's audio (24000 for Gemini)
    pub fn open(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let path = path.as_ref();
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let writer = if path.exists() {
            let writer = WavWriter::append(path).with_context(|| format!("Failed to open {} for appending", path.display()))?;
            if writer.spec() != spec {
                anyhow::bail!("Existing file {} has format {:?}, expected {:?}", path.display(), writer.spec(), spec);
            }
            info!("Appending model audio to existing file: {}", path.display());
            writer
        } else {
            info!("Writing model audio to: {}", path.display());
            WavWriter::create(path, spec).with_context(|| format!("Failed to create {}", path.display()))?
        };

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            bytes_written: 0,
        })
    }

    /// Append one audio payload, verbatim, as little-endian 16-bit samples.
    ///
    /// Payloads are trusted to be PCM in the container's format; a trailing
    /// odd byte is ignored.
    pub fn append(&mut self, pcm: &[u8]) -> Result<()> {
        for sample in pcm.chunks_exact(2) {
            self.writer.write_sample(i16::from_le_bytes([sample[0], sample[1]])).context("Failed to append audio sample")?;
        }
        self.bytes_written += (pcm.len() - pcm.len() % 2) as u64;
        debug!("Appended {} bytes of model audio", pcm.len());
        Ok(())
    }

    /// Flush and close the container, patching up the WAV header.
    pub fn finalize(self) -> Result<()> {
        info!("Wrote {} bytes of model audio to {}", self.bytes_written, self.path.display());
        self.writer.finalize().context("Failed to finalize output file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    #[test]
    fn test_appends_payloads_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = ResponseSink::open(&path, 24000).unwrap();
        sink.append(&[0x01, 0x02]).unwrap();
        sink.append(&[0x03, 0x04]).unwrap();
        sink.finalize().unwrap();

        let reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 24000);
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![i16::from_le_bytes([0x01, 0x02]), i16::from_le_bytes([0x03, 0x04])]);
    }

    #[test]
    fn test_reopen_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = ResponseSink::open(&path, 24000).unwrap();
        sink.append(&[0x01, 0x00]).unwrap();
        sink.finalize().unwrap();

        let mut sink = ResponseSink::open(&path, 24000).unwrap();
        sink.append(&[0x02, 0x00]).unwrap();
        sink.finalize().unwrap();

        let reader = WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![1, 2]);
    }

    #[test]
    fn test_rejects_mismatched_existing_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let sink = ResponseSink::open(&path, 24000).unwrap();
        sink.finalize().unwrap();

        assert!(ResponseSink::open(&path, 16000).is_err());
    }

    #[test]
    fn test_trailing_odd_byte_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut sink = ResponseSink::open(&path, 24000).unwrap();
        sink.append(&[0x01, 0x02, 0xFF]).unwrap();
        sink.finalize().unwrap();

        let reader = WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert_eq!(samples, vec![i16::from_le_bytes([0x01, 0x02])]);
    }
}
