//! WAV recording of session audio

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::pcm;
use crate::Result;

/// Appends mono samples to a PCM16 WAV file
pub struct WavRecorder {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    samples_written: u64,
}

impl WavRecorder {
    /// Create (or truncate) a WAV file at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = hound::WavWriter::create(&path, pcm::wav_spec(sample_rate))?;
        tracing::info!(path = %path.display(), sample_rate, "recording session audio");
        Ok(Self {
            path,
            writer: Some(writer),
            samples_written: 0,
        })
    }

    /// Append samples; ignored once finalized
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn append(&mut self, samples: &[f32]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for &sample in samples {
            writer.write_sample(pcm::f32_to_i16(sample))?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Flush the header and close the file; idempotent
    ///
    /// # Errors
    ///
    /// Returns error if the header cannot be written
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            tracing::info!(
                path = %self.path.display(),
                samples = self.samples_written,
                "recording finalized"
            );
        }
        Ok(())
    }

    #[must_use]
    pub const fn samples_written(&self) -> u64 {
        self.samples_written
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(error = %e, "failed to finalize recording");
        }
    }
}
