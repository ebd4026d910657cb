//! Pipeline configuration.
//!
//! Numeric defaults match the original SadTalker checkpoints: 25 fps video,
//! 16 kHz mono analysis audio, 80-bin mel features in 16-frame chunks, and
//! 70-dimensional motion coefficients (64 expression + 3 rotation +
//! 3 translation).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How much of the source image is preserved around the detected face.
///
/// The mode changes only the crop geometry (and therefore the inverse
/// transform used for reprojection) — detection and landmarks are identical
/// across modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessMode {
    /// Tight portrait crop around the face.
    Crop,
    /// Keep the full image; the face crop covers the face plus margin.
    Full,
    /// Full image with an extended crop region.
    ExtFull,
}

impl PreprocessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreprocessMode::Crop => "crop",
            PreprocessMode::Full => "full",
            PreprocessMode::ExtFull => "extfull",
        }
    }

    /// Whether this mode forces a still head (pose block zeroed).
    ///
    /// Matches the original CLI, which keeps the head still for `full`
    /// only; `extfull` animates the pose normally.
    pub fn implies_still(&self) -> bool {
        matches!(self, PreprocessMode::Full)
    }

    /// Padding factor applied around the detected box when building the
    /// square crop region, as a fraction of the box size.
    pub(crate) fn padding_factor(&self) -> f32 {
        match self {
            PreprocessMode::Crop => 0.25,
            PreprocessMode::Full => 0.60,
            PreprocessMode::ExtFull => 1.00,
        }
    }
}

impl FromStr for PreprocessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crop" => Ok(PreprocessMode::Crop),
            "full" => Ok(PreprocessMode::Full),
            "extfull" => Ok(PreprocessMode::ExtFull),
            other => Err(Error::Config(format!(
                "unknown preprocess mode {other:?} (expected crop|full|extfull)"
            ))),
        }
    }
}

/// Supported output face resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameSize {
    S256,
    S512,
}

impl FrameSize {
    pub fn pixels(&self) -> usize {
        match self {
            FrameSize::S256 => 256,
            FrameSize::S512 => 512,
        }
    }
}

impl FromStr for FrameSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "256" => Ok(FrameSize::S256),
            "512" => Ok(FrameSize::S512),
            other => Err(Error::Config(format!(
                "unsupported frame size {other:?} (expected 256|512)"
            ))),
        }
    }
}

/// Face restoration backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancerKind {
    None,
    Gfpgan,
}

impl EnhancerKind {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, EnhancerKind::None)
    }
}

impl FromStr for EnhancerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(EnhancerKind::None),
            "gfpgan" => Ok(EnhancerKind::Gfpgan),
            other => Err(Error::Config(format!(
                "unknown enhancer {other:?} (expected none|gfpgan)"
            ))),
        }
    }
}

/// Mel spectrogram configuration. Defaults match the SadTalker audio
/// front-end (wav2lip lineage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Analysis sample rate; clips are resampled to this before the STFT.
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
    /// Pre-emphasis coefficient applied before the STFT.
    pub preemphasis: f64,
    /// Reference level in dB subtracted after log conversion.
    pub ref_level_db: f64,
    /// Floor in dB; values below are clipped.
    pub min_level_db: f64,
    /// Symmetric normalization range: output lands in [-max_abs, max_abs].
    pub max_abs_value: f64,
    /// Mel frames per acoustic feature chunk (one chunk per video frame).
    pub mel_step_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            n_fft: 800,
            win_length: 800,
            hop_length: 200,
            n_mels: 80,
            f_min: 55.0,
            f_max: 7600.0,
            preemphasis: 0.97,
            ref_level_db: 20.0,
            min_level_db: -100.0,
            max_abs_value: 4.0,
            mel_step_size: 16,
        }
    }
}

impl AudioConfig {
    /// Mel frames per second of audio.
    pub fn mel_fps(&self) -> f64 {
        self.sample_rate as f64 / self.hop_length as f64
    }
}

/// Motion coefficient layout: 64 expression + 3 rotation + 3 translation.
pub const EXP_DIM: usize = 64;
pub const POSE_DIM: usize = 6;
pub const COEFF_DIM: usize = EXP_DIM + POSE_DIM;

/// Fixed output video frame rate.
pub const FPS: f64 = 25.0;

/// Temporal smoothing window (frames) applied to predicted coefficients.
pub const SMOOTH_WINDOW: usize = 5;

/// Per-run pipeline options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub preprocess: PreprocessMode,
    pub size: FrameSize,
    pub enhancer: EnhancerKind,
    /// Enhancement blend strength in [0, 1]; 1.0 replaces the frame with the
    /// restored output, 0.0 is a no-op.
    pub enhancer_strength: f32,
    /// Inference batch size for the coefficient predictor and renderer.
    /// Purely a throughput knob; outputs are invariant to it.
    pub batch_size: usize,
    /// Deterministic head-pose style seed (0 = neutral).
    pub pose_style: u8,
    /// Keep the head still (pose coefficients zeroed); implied by the
    /// `full` preprocess mode.
    pub still: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            preprocess: PreprocessMode::Crop,
            size: FrameSize::S256,
            enhancer: EnhancerKind::None,
            enhancer_strength: 1.0,
            batch_size: 1,
            pose_style: 0,
            still: false,
        }
    }
}

impl PipelineOptions {
    /// Validate the option set before any stage runs.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.enhancer_strength) {
            return Err(Error::Config(format!(
                "enhancer strength must be in [0, 1], got {}",
                self.enhancer_strength
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preprocess_modes() {
        assert_eq!(
            "crop".parse::<PreprocessMode>().unwrap(),
            PreprocessMode::Crop
        );
        assert_eq!(
            "extfull".parse::<PreprocessMode>().unwrap(),
            PreprocessMode::ExtFull
        );
        assert!("tight".parse::<PreprocessMode>().is_err());
    }

    #[test]
    fn only_full_mode_implies_still() {
        assert!(!PreprocessMode::Crop.implies_still());
        assert!(PreprocessMode::Full.implies_still());
        assert!(!PreprocessMode::ExtFull.implies_still());
    }

    #[test]
    fn parse_frame_sizes() {
        assert_eq!("256".parse::<FrameSize>().unwrap().pixels(), 256);
        assert_eq!("512".parse::<FrameSize>().unwrap().pixels(), 512);
        assert!("1024".parse::<FrameSize>().is_err());
    }

    #[test]
    fn parse_enhancer() {
        assert_eq!("".parse::<EnhancerKind>().unwrap(), EnhancerKind::None);
        assert_eq!(
            "gfpgan".parse::<EnhancerKind>().unwrap(),
            EnhancerKind::Gfpgan
        );
        assert!("esrgan".parse::<EnhancerKind>().is_err());
    }

    #[test]
    fn audio_defaults() {
        let cfg = AudioConfig::default();
        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.n_mels, 80);
        // 16000 / 200 = 80 mel frames per second
        assert!((cfg.mel_fps() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn options_validation() {
        let mut opts = PipelineOptions::default();
        assert!(opts.validate().is_ok());
        opts.batch_size = 0;
        assert!(opts.validate().is_err());
        opts.batch_size = 4;
        opts.enhancer_strength = 1.5;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn coeff_layout() {
        assert_eq!(COEFF_DIM, 70);
        assert_eq!(EXP_DIM + POSE_DIM, COEFF_DIM);
    }
}
