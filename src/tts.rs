//! External speech synthesis collaborator (Piper).
//!
//! The synthesizer is an external process invoked with a text string and a
//! target output path. The pipeline's precondition is only "a playable
//! waveform exists at the target path"; the wait for that file is a bounded
//! poll with an explicit timeout, surfaced as a typed [`WaitOutcome`] rather
//! than unbounded blocking I/O.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::{Error, Result};

/// Default bound on the wait for the synthesized waveform.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default poll interval while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of waiting for the external process's output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A non-empty waveform exists at the target path.
    Ready,
    /// The timeout elapsed without a usable file appearing.
    TimedOut,
}

/// Handle to the external Piper TTS command.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    /// Piper executable name or path.
    command: PathBuf,
    /// Voice model (`.onnx`) path.
    voice: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Synthesizer {
    pub fn new(voice: impl Into<PathBuf>) -> Self {
        Self {
            command: PathBuf::from("piper"),
            voice: voice.into(),
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    /// Check the voice model before any stage runs.
    pub fn validate(&self) -> Result<()> {
        if !self.voice.is_file() {
            return Err(Error::Config(format!(
                "piper voice model not found: {}",
                self.voice.display()
            )));
        }
        Ok(())
    }

    /// Synthesize `text` to a WAV at `output`, waiting (bounded) for the
    /// file to appear.
    pub async fn speak(&self, text: &str, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(voice = %self.voice.display(), out = %output.display(), "running piper");
        let status = Command::new(&self.command)
            .arg("-m")
            .arg(&self.voice)
            .arg("-t")
            .arg(text)
            .arg("-f")
            .arg(output)
            .status()
            .await
            .map_err(|e| Error::Config(format!("failed to spawn piper: {e}")))?;

        if !status.success() {
            return Err(Error::Audio(format!(
                "piper exited with status {status}"
            )));
        }

        match wait_for_waveform(output, self.timeout, self.poll_interval).await {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut => Err(Error::SpeechSynthesisTimeout {
                waited: self.timeout,
            }),
        }
    }
}

/// Poll for a non-empty waveform file at `path`, bounded by `timeout`.
pub async fn wait_for_waveform(
    path: &Path,
    timeout: Duration,
    poll_interval: Duration,
) -> WaitOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_file() && meta.len() > 0 {
                return WaitOutcome::Ready;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_file_is_ready_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        std::fs::write(&path, b"RIFFdata").unwrap();
        let outcome = wait_for_waveform(
            &path,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[tokio::test]
    async fn missing_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.wav");
        let outcome = wait_for_waveform(
            &path,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn empty_file_does_not_count_as_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        std::fs::write(&path, b"").unwrap();
        let outcome = wait_for_waveform(
            &path,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn file_appearing_mid_wait_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.wav");
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                std::fs::write(&path, b"RIFFdata").unwrap();
            })
        };
        let outcome = wait_for_waveform(
            &path,
            Duration::from_millis(500),
            Duration::from_millis(5),
        )
        .await;
        writer.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[test]
    fn missing_voice_model_is_config_error() {
        let synth = Synthesizer::new("/nonexistent/voice.onnx");
        assert!(synth.validate().unwrap_err().is_configuration());
    }
}
