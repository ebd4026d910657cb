//! Optional face restoration (GFPGAN-style residual enhancer).
//!
//! Purely a post-process: a residual conv net predicts a correction that is
//! blended into the rendered frame with a configurable strength. Disabling
//! the enhancer is behaviorally identical to skipping the stage — the frame
//! sequence passes through unchanged.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use image::RgbImage;

use crate::face::{image_to_tensor, tensor_to_image};
use crate::{Error, Result};

/// Residual face restoration network.
#[derive(Debug)]
pub struct FaceEnhancer {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    device: Device,
}

impl FaceEnhancer {
    /// Build the network from a [`VarBuilder`].
    ///
    /// Weight paths: `conv{1,2,3}.{weight,bias}`.
    pub fn new(vb: VarBuilder, device: &Device) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(3, 32, 3, pad1, vb.pp("conv1"))?;
        let conv2 = conv2d(32, 32, 3, pad1, vb.pp("conv2"))?;
        let conv3 = conv2d(32, 3, 3, pad1, vb.pp("conv3"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            device: device.clone(),
        })
    }

    /// Load weights from a safetensors file.
    ///
    /// Availability is checked by the orchestrator before any stage runs;
    /// reaching this with a missing file is still a configuration error.
    pub fn load(path: &std::path::Path, device: &Device) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Config(format!(
                "enhancer weights not found: {}",
                path.display()
            )));
        }
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.to_path_buf()], DType::F32, device)?
        };
        Self::new(vb, device)
    }

    /// Enhance one frame, blending by `strength` in [0, 1].
    ///
    /// `strength == 0.0` returns the input unchanged (bytewise).
    pub fn enhance(&self, frame: &RgbImage, strength: f32) -> Result<RgbImage> {
        if strength == 0.0 {
            return Ok(frame.clone());
        }

        let input = image_to_tensor(frame, &self.device)?;
        let residual = self.forward(&input)?;
        let restored = (input.squeeze(0)? + residual.squeeze(0)?)?.clamp(0.0, 1.0)?;
        let restored = tensor_to_image(&restored)?;

        if (strength - 1.0).abs() < f32::EPSILON {
            return Ok(restored);
        }
        Ok(blend(frame, &restored, strength))
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let xs = self.conv1.forward(input)?.relu()?;
        let xs = self.conv2.forward(&xs)?.relu()?;
        Ok(self.conv3.forward(&xs)?)
    }
}

/// Per-pixel linear blend: `out = a * (1 - t) + b * t`.
fn blend(a: &RgbImage, b: &RgbImage, t: f32) -> RgbImage {
    let mut out = a.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y).0;
        let pb = b.get_pixel(x, y).0;
        for c in 0..3 {
            pixel.0[c] = (pa[c] as f32 * (1.0 - t) + pb[c] as f32 * t)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn test_enhancer() -> FaceEnhancer {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        FaceEnhancer::new(vb, &device).unwrap()
    }

    fn checker(w: u32, h: u32) -> RgbImage {
        let mut img = RgbImage::new(w, h);
        for (x, y, p) in img.enumerate_pixels_mut() {
            let v = if (x + y) % 2 == 0 { 200 } else { 40 };
            *p = image::Rgb([v, v, v]);
        }
        img
    }

    #[test]
    fn zero_strength_is_identity() {
        let enhancer = test_enhancer();
        let frame = checker(32, 32);
        let out = enhancer.enhance(&frame, 0.0).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn output_keeps_resolution() {
        let enhancer = test_enhancer();
        let frame = checker(48, 48);
        let out = enhancer.enhance(&frame, 1.0).unwrap();
        assert_eq!(out.dimensions(), frame.dimensions());
    }

    #[test]
    fn enhancement_is_deterministic() {
        let enhancer = test_enhancer();
        let frame = checker(32, 32);
        let a = enhancer.enhance(&frame, 0.7).unwrap();
        let b = enhancer.enhance(&frame, 0.7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_weights_is_config_error() {
        let err =
            FaceEnhancer::load(std::path::Path::new("/nonexistent/gfpgan.safetensors"), &Device::Cpu)
                .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn blend_midpoint() {
        let mut a = RgbImage::new(1, 1);
        a.put_pixel(0, 0, image::Rgb([0, 100, 200]));
        let mut b = RgbImage::new(1, 1);
        b.put_pixel(0, 0, image::Rgb([100, 0, 200]));
        let out = blend(&a, &b, 0.5);
        assert_eq!(out.get_pixel(0, 0).0, [50, 50, 200]);
    }
}
