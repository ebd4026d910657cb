//! Error types for sadtalker-rs.

use std::time::Duration;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Every pipeline stage fails fast and fails the whole run; the orchestrator
/// in [`crate::pipeline`] is the single place that classifies these for the
/// caller. Stages only construct the structured variants below.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration or missing model weights, detected before any
    /// stage runs.
    #[error("config: {0}")]
    Config(String),

    /// The face detector found zero usable faces in the source image.
    #[error("no face detected in source image")]
    NoFaceDetected,

    /// The audio clip is shorter than one analysis window.
    #[error("audio too short: {samples} samples, need at least {required}")]
    AudioTooShort { samples: usize, required: usize },

    /// The external speech synthesizer did not produce a waveform in time.
    #[error("speech synthesis timed out after {waited:?}")]
    SpeechSynthesisTimeout { waited: Duration },

    /// Numerical instability in the predicted motion coefficients.
    #[error("coefficient prediction: {0}")]
    CoefficientPrediction(String),

    /// Failure warping or reprojecting a frame.
    #[error("rendering: {0}")]
    Rendering(String),

    /// Failure combining frames and audio into the output container.
    #[error("assembly: {0}")]
    Assembly(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Audio decoding error (WAV I/O, resampling).
    #[error("audio: {0}")]
    Audio(String),

    /// Image decoding/encoding error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Pipeline manager error (queueing, worker lifecycle).
    #[error("manager: {0}")]
    Manager(String),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl Error {
    /// True for errors that indicate a bad setup rather than a bad input —
    /// these are reported before any stage of a run executes.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_configuration() {
        assert!(Error::Config("missing weights".into()).is_configuration());
        assert!(!Error::NoFaceDetected.is_configuration());
        assert!(!Error::Rendering("warp failed".into()).is_configuration());
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::AudioTooShort {
            samples: 100,
            required: 800,
        };
        let msg = e.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("800"));
    }
}
