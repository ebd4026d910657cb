//! Audio front-end: clip loading, resampling, and acoustic features.
//!
//! An [`AudioClip`] is loaded once per run and is the source of truth for
//! both feature extraction and the final mux — the original samples are
//! never re-decoded. Feature extraction resamples a working copy to the
//! 16 kHz analysis rate, computes a mel spectrogram, and slices it into one
//! fixed-size chunk per output video frame.

mod mel;
mod wav;

use std::path::Path;

pub use mel::MelSpectrogram;
pub use wav::{read_wav, write_wav};

use crate::config::AudioConfig;
use crate::{Error, Result};

/// A decoded waveform. Immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct AudioClip {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioClip {
    /// Load a WAV file, downmixing to mono.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let (interleaved, sample_rate, channels) = read_wav(path)?;
        if interleaved.is_empty() {
            return Err(Error::Audio("empty audio file".into()));
        }
        let samples = downmix_mono(&interleaved, channels);
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Construct from raw mono samples (used in tests and by the TTS path).
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Number of output video frames for this clip: `round(duration * fps)`.
    pub fn num_frames(&self, fps: f64) -> usize {
        (self.duration_secs() * fps).round() as usize
    }

    /// Return samples resampled to `target_rate` (linear interpolation).
    pub fn resampled(&self, target_rate: u32) -> Vec<f32> {
        if self.sample_rate == target_rate {
            return self.samples.clone();
        }
        resample_linear(&self.samples, self.sample_rate, target_rate)
    }
}

/// Downmix interleaved multi-channel samples to mono by averaging.
fn downmix_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let ch = channels as usize;
    interleaved
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// One fixed-size acoustic feature chunk per output video frame.
///
/// Each chunk is an `n_mels x mel_step_size` mel window flattened row-major
/// (mel bin major), the predictor's expected input layout.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticFeatureSequence {
    chunks: Vec<Vec<f32>>,
    n_mels: usize,
    step: usize,
}

impl AcousticFeatureSequence {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn chunk(&self, i: usize) -> &[f32] {
        &self.chunks[i]
    }

    pub fn chunks(&self) -> &[Vec<f32>] {
        &self.chunks
    }
}

/// Extract per-frame acoustic features from a clip.
///
/// Pure function of the waveform: resample to the analysis rate, compute the
/// mel spectrogram, then slice one `n_mels x mel_step_size` window per video
/// frame starting at `floor(mel_fps * i / fps)`. Windows that run past the
/// end of the spectrogram are padded by repeating the last mel frame.
///
/// Fails with [`Error::AudioTooShort`] when the clip holds less than one
/// analysis window of audio or maps to zero video frames.
pub fn extract_features(
    clip: &AudioClip,
    config: &AudioConfig,
    fps: f64,
) -> Result<AcousticFeatureSequence> {
    let analysis = clip.resampled(config.sample_rate);
    if analysis.len() < config.win_length {
        return Err(Error::AudioTooShort {
            samples: analysis.len(),
            required: config.win_length,
        });
    }

    let num_frames = clip.num_frames(fps);
    if num_frames == 0 {
        return Err(Error::AudioTooShort {
            samples: analysis.len(),
            required: config.win_length,
        });
    }

    let mel = MelSpectrogram::new(config.clone()).process(&analysis);
    let mel_frames = mel[0].len();
    let mel_fps = config.mel_fps();

    let mut chunks = Vec::with_capacity(num_frames);
    for frame in 0..num_frames {
        let start = ((mel_fps * frame as f64) / fps).floor() as usize;
        let mut chunk = Vec::with_capacity(config.n_mels * config.mel_step_size);
        for bin in 0..config.n_mels {
            for t in 0..config.mel_step_size {
                // Trailing windows repeat the final mel frame.
                let idx = (start + t).min(mel_frames - 1);
                chunk.push(mel[bin][idx] as f32);
            }
        }
        chunks.push(chunk);
    }

    tracing::debug!(
        frames = num_frames,
        mel_frames,
        duration_s = clip.duration_secs(),
        "extracted acoustic features"
    );

    Ok(AcousticFeatureSequence {
        chunks,
        n_mels: config.n_mels,
        step: config.mel_step_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FPS;

    fn sine_clip(duration_s: f64, sample_rate: u32) -> AudioClip {
        let n = (duration_s * sample_rate as f64).round() as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                (2.0 * std::f64::consts::PI * 330.0 * i as f64 / sample_rate as f64).sin() as f32
                    * 0.4
            })
            .collect();
        AudioClip::from_samples(samples, sample_rate)
    }

    #[test]
    fn frame_count_is_round_duration_times_fps() {
        for duration in [0.5, 1.0, 1.02, 2.3, 3.77] {
            let clip = sine_clip(duration, 16_000);
            let features =
                extract_features(&clip, &AudioConfig::default(), FPS).unwrap();
            let expected = (duration * FPS).round() as usize;
            assert_eq!(features.len(), expected, "duration {duration}");
        }
    }

    #[test]
    fn one_second_yields_25_chunks() {
        let clip = sine_clip(1.0, 16_000);
        let features = extract_features(&clip, &AudioConfig::default(), FPS).unwrap();
        assert_eq!(features.len(), 25);
        assert_eq!(features.chunk(0).len(), 80 * 16);
    }

    #[test]
    fn too_short_clip_is_rejected() {
        // 799 samples at 16 kHz is below one 800-sample analysis window.
        let clip = AudioClip::from_samples(vec![0.1; 799], 16_000);
        match extract_features(&clip, &AudioConfig::default(), FPS) {
            Err(Error::AudioTooShort { samples, required }) => {
                assert_eq!(samples, 799);
                assert_eq!(required, 800);
            }
            other => panic!("expected AudioTooShort, got {other:?}"),
        }
    }

    #[test]
    fn features_are_deterministic() {
        let clip = sine_clip(1.3, 16_000);
        let a = extract_features(&clip, &AudioConfig::default(), FPS).unwrap();
        let b = extract_features(&clip, &AudioConfig::default(), FPS).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resampling_preserves_duration() {
        let clip = sine_clip(1.0, 44_100);
        let resampled = clip.resampled(16_000);
        assert!((resampled.len() as f64 - 16_000.0).abs() <= 2.0);
        // And the feature count matches the original duration.
        let features = extract_features(&clip, &AudioConfig::default(), FPS).unwrap();
        assert_eq!(features.len(), 25);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        let mono = downmix_mono(&stereo, 2);
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
    }
}
