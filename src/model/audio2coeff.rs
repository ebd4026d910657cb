//! Audio-to-motion coefficient predictor.
//!
//! Maps each per-frame acoustic feature chunk (an 80x16 mel window) to a
//! 70-dimensional motion coefficient vector: 64 expression values followed
//! by 6 pose values (rotation + translation). A moving-average pass over a
//! small window keeps the output temporally smooth.
//!
//! Batching is purely a throughput knob: frames are processed in batches of
//! the configured size and concatenated in order, so the numeric result is
//! invariant to the batch size.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::audio::AcousticFeatureSequence;
use crate::config::{COEFF_DIM, EXP_DIM, POSE_DIM, SMOOTH_WINDOW};
use crate::{Error, Result};

/// One motion coefficient vector per output video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionCoefficientSequence {
    frames: Vec<Vec<f32>>,
}

impl MotionCoefficientSequence {
    pub fn new(frames: Vec<Vec<f32>>) -> Self {
        debug_assert!(frames.iter().all(|f| f.len() == COEFF_DIM));
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, i: usize) -> &[f32] {
        &self.frames[i]
    }

    pub fn frames(&self) -> &[Vec<f32>] {
        &self.frames
    }

    /// Largest absolute frame-to-frame coefficient change.
    pub fn max_frame_delta(&self) -> f32 {
        self.frames
            .windows(2)
            .flat_map(|pair| {
                pair[0]
                    .iter()
                    .zip(pair[1].iter())
                    .map(|(a, b)| (a - b).abs())
            })
            .fold(0.0f32, f32::max)
    }
}

/// Options for one prediction pass.
#[derive(Debug, Clone, Copy)]
pub struct PredictOptions {
    /// Frames per inference batch (>= 1). Affects throughput only.
    pub batch_size: usize,
    /// Deterministic head-pose style seed; 0 is neutral.
    pub pose_style: u8,
    /// Zero out the pose block, keeping the head still.
    pub still: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            pose_style: 0,
            still: false,
        }
    }
}

/// The coefficient predictor network.
pub struct Audio2Coeff {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    fc1: Linear,
    fc2: Linear,
    device: Device,
}

impl Audio2Coeff {
    /// Build the network from a [`VarBuilder`].
    ///
    /// Weight paths: `conv{1,2,3}.{weight,bias}`, `fc{1,2}.{weight,bias}`.
    pub fn new(vb: VarBuilder, device: &Device) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let stride2 = Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(1, 32, 3, pad1, vb.pp("conv1"))?;
        let conv2 = conv2d(32, 64, 3, stride2, vb.pp("conv2"))?;
        let conv3 = conv2d(64, 128, 3, stride2, vb.pp("conv3"))?;
        // 80x16 input downsampled twice: 20x4 spatial, 128 channels.
        let fc1 = linear(128 * 20 * 4, 256, vb.pp("fc1"))?;
        let fc2 = linear(256, COEFF_DIM, vb.pp("fc2"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            fc1,
            fc2,
            device: device.clone(),
        })
    }

    /// Load weights from a safetensors file.
    pub fn load(path: &std::path::Path, device: &Device) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.to_path_buf()], DType::F32, device)?
        };
        Self::new(vb, device)
    }

    /// Predict one coefficient vector per feature chunk.
    ///
    /// Output length always equals `features.len()`, which the extractor
    /// guarantees is `round(duration * fps)`. Any non-finite value in the
    /// output aborts the run with [`Error::CoefficientPrediction`].
    pub fn predict(
        &self,
        features: &AcousticFeatureSequence,
        options: &PredictOptions,
    ) -> Result<MotionCoefficientSequence> {
        if options.batch_size == 0 {
            return Err(Error::Config("batch size must be >= 1".into()));
        }

        let n_mels = features.n_mels();
        let step = features.step();
        let mut raw: Vec<Vec<f32>> = Vec::with_capacity(features.len());

        for batch in features.chunks().chunks(options.batch_size) {
            let tensors: Vec<Tensor> = batch
                .iter()
                .map(|chunk| Tensor::from_slice(chunk.as_slice(), (n_mels, step), &self.device))
                .collect::<candle_core::Result<_>>()?;
            let input = Tensor::stack(&tensors, 0)?;
            let output = self.forward(&input)?;
            let rows: Vec<Vec<f32>> = output.to_vec2()?;
            raw.extend(rows);
        }

        let bias = pose_style_bias(options.pose_style);
        for frame in raw.iter_mut() {
            for (j, b) in bias.iter().enumerate() {
                frame[EXP_DIM + j] += b;
            }
            if options.still {
                for v in frame[EXP_DIM..].iter_mut() {
                    *v = 0.0;
                }
            }
        }

        let smoothed = smooth(&raw, SMOOTH_WINDOW);

        for (i, frame) in smoothed.iter().enumerate() {
            if frame.iter().any(|v| !v.is_finite()) {
                return Err(Error::CoefficientPrediction(format!(
                    "non-finite coefficient at frame {i}"
                )));
            }
        }

        tracing::debug!(
            frames = smoothed.len(),
            batch_size = options.batch_size,
            pose_style = options.pose_style,
            "predicted motion coefficients"
        );

        Ok(MotionCoefficientSequence::new(smoothed))
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let batch = input.dim(0)?;
        let xs = input.unsqueeze(1)?; // [B, 1, n_mels, step]
        let xs = self.conv1.forward(&xs)?.relu()?;
        let xs = self.conv2.forward(&xs)?.relu()?;
        let xs = self.conv3.forward(&xs)?.relu()?;
        let xs = xs.reshape((batch, 128 * 20 * 4))?;
        let xs = self.fc1.forward(&xs)?.relu()?;
        Ok(self.fc2.forward(&xs)?)
    }
}

/// Deterministic pose bias for a style seed. Style 0 is neutral (all zero).
fn pose_style_bias(style: u8) -> [f32; POSE_DIM] {
    let mut bias = [0.0f32; POSE_DIM];
    if style == 0 {
        return bias;
    }
    for (j, slot) in bias.iter_mut().enumerate() {
        *slot = (style as f32 * 0.618 * (j + 1) as f32).sin() * 0.1;
    }
    bias
}

/// Centered moving average over `window` frames, per coefficient dimension.
///
/// Window edges shrink at the sequence boundaries so the output length
/// equals the input length.
fn smooth(frames: &[Vec<f32>], window: usize) -> Vec<Vec<f32>> {
    if frames.len() < 2 || window < 2 {
        return frames.to_vec();
    }
    let half = window / 2;
    let dim = frames[0].len();
    let mut out = Vec::with_capacity(frames.len());
    for i in 0..frames.len() {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(frames.len());
        let count = (hi - lo) as f32;
        let mut acc = vec![0.0f32; dim];
        for frame in &frames[lo..hi] {
            for (a, v) in acc.iter_mut().zip(frame.iter()) {
                *a += v;
            }
        }
        for a in acc.iter_mut() {
            *a /= count;
        }
        out.push(acc);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::extract_features;
    use crate::audio::AudioClip;
    use crate::config::{AudioConfig, FPS};
    use candle_nn::VarMap;

    fn test_model() -> Audio2Coeff {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Audio2Coeff::new(vb, &device).unwrap()
    }

    fn test_features(duration_s: f64) -> AcousticFeatureSequence {
        let n = (duration_s * 16_000.0) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                (2.0 * std::f64::consts::PI * 180.0 * i as f64 / 16_000.0).sin() as f32 * 0.5
            })
            .collect();
        let clip = AudioClip::from_samples(samples, 16_000);
        extract_features(&clip, &AudioConfig::default(), FPS).unwrap()
    }

    #[test]
    fn output_length_matches_feature_count() {
        let model = test_model();
        let features = test_features(1.0);
        let coeffs = model.predict(&features, &PredictOptions::default()).unwrap();
        assert_eq!(coeffs.len(), 25);
        assert_eq!(coeffs.frame(0).len(), COEFF_DIM);
    }

    #[test]
    fn batch_size_invariance() {
        let model = test_model();
        let features = test_features(1.0);
        let reference = model
            .predict(
                &features,
                &PredictOptions {
                    batch_size: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        for batch_size in [2, 4, 7, 25, 64] {
            let other = model
                .predict(
                    &features,
                    &PredictOptions {
                        batch_size,
                        ..Default::default()
                    },
                )
                .unwrap();
            assert_eq!(other.len(), reference.len());
            for i in 0..reference.len() {
                for (a, b) in reference.frame(i).iter().zip(other.frame(i)) {
                    assert!(
                        (a - b).abs() < 1e-5,
                        "batch {batch_size}, frame {i}: {a} vs {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn prediction_is_deterministic() {
        let model = test_model();
        let features = test_features(0.8);
        let a = model.predict(&features, &PredictOptions::default()).unwrap();
        let b = model.predict(&features, &PredictOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn still_mode_zeroes_pose_block() {
        let model = test_model();
        let features = test_features(0.5);
        let coeffs = model
            .predict(
                &features,
                &PredictOptions {
                    still: true,
                    pose_style: 7,
                    ..Default::default()
                },
            )
            .unwrap();
        for i in 0..coeffs.len() {
            for &v in &coeffs.frame(i)[EXP_DIM..] {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn pose_style_zero_is_neutral() {
        assert_eq!(pose_style_bias(0), [0.0; POSE_DIM]);
        let b = pose_style_bias(3);
        assert!(b.iter().any(|&v| v != 0.0));
        // Deterministic for the same seed.
        assert_eq!(b, pose_style_bias(3));
    }

    #[test]
    fn smoothing_preserves_length_and_bounds_delta() {
        let frames: Vec<Vec<f32>> = (0..20)
            .map(|i| vec![if i % 2 == 0 { 1.0 } else { -1.0 }; 4])
            .collect();
        let smoothed = smooth(&frames, SMOOTH_WINDOW);
        assert_eq!(smoothed.len(), frames.len());
        let raw_delta = 2.0f32;
        let smoothed_delta = smoothed
            .windows(2)
            .flat_map(|p| p[0].iter().zip(p[1].iter()).map(|(a, b)| (a - b).abs()))
            .fold(0.0f32, f32::max);
        assert!(smoothed_delta < raw_delta);
    }

    #[test]
    fn smoothing_constant_signal_is_identity() {
        let frames = vec![vec![0.25f32; COEFF_DIM]; 10];
        let smoothed = smooth(&frames, SMOOTH_WINDOW);
        for frame in &smoothed {
            for &v in frame {
                assert!((v - 0.25).abs() < 1e-6);
            }
        }
    }
}
