//! WAV dumps of session audio using hound
//!
//! When enabled, the session keeps a copy of what was sent and what was
//! received so a conversation can be listened back to for diagnostics.

use hound::{WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::pcm::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

/// Audio captured and received during one session
#[derive(Debug, Default, Clone)]
pub struct SessionRecording {
    /// Microphone audio as sent, 16 kHz
    pub captured: Vec<f32>,
    /// Model audio as scheduled, 24 kHz
    pub received: Vec<f32>,
}

impl SessionRecording {
    pub fn is_empty(&self) -> bool {
        self.captured.is_empty() && self.received.is_empty()
    }
}

/// Paths written for one session recording
#[derive(Debug, Clone)]
pub struct SavedRecording {
    pub captured: Option<PathBuf>,
    pub received: Option<PathBuf>,
}

/// WAV file recorder
pub struct WavRecorder {
    recordings_dir: PathBuf,
}

impl WavRecorder {
    pub fn new(recordings_dir: impl AsRef<Path>) -> Self {
        Self {
            recordings_dir: recordings_dir.as_ref().to_path_buf(),
        }
    }

    /// Default recordings directory under the user's data dir
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicelink")
            .join("recordings")
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    /// Save both sides of a session, skipping empty streams
    pub fn save_session(&self, recording: &SessionRecording) -> Result<SavedRecording, String> {
        std::fs::create_dir_all(&self.recordings_dir)
            .map_err(|e| format!("Failed to create recordings directory: {}", e))?;

        let stem = self.generate_stem();

        let captured = if recording.captured.is_empty() {
            None
        } else {
            let path = self.recordings_dir.join(format!("{}_mic.wav", stem));
            Self::write(&path, &recording.captured, INPUT_SAMPLE_RATE)?;
            Some(path)
        };

        let received = if recording.received.is_empty() {
            None
        } else {
            let path = self.recordings_dir.join(format!("{}_model.wav", stem));
            Self::write(&path, &recording.received, OUTPUT_SAMPLE_RATE)?;
            Some(path)
        };

        Ok(SavedRecording { captured, received })
    }

    fn generate_stem(&self) -> String {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string()[..8].to_string();
        format!("session_{}_{}", timestamp, uuid)
    }

    /// Write mono f32 samples to a WAV file
    pub fn write(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), String> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let file = File::create(path).map_err(|e| format!("Failed to create file: {}", e))?;

        let writer = BufWriter::new(file);
        let mut wav_writer = WavWriter::new(writer, spec)
            .map_err(|e| format!("Failed to create WAV writer: {}", e))?;

        for &sample in samples {
            wav_writer
                .write_sample(sample)
                .map_err(|e| format!("Failed to write sample: {}", e))?;
        }

        wav_writer
            .finalize()
            .map_err(|e| format!("Failed to finalize WAV file: {}", e))
    }

    /// Get duration of samples in seconds
    pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
        sample_count as f64 / sample_rate as f64
    }
}
