//! Motion renderer: warps the normalized face crop per coefficient frame
//! and reprojects the result into original-image coordinates.
//!
//! The generator encodes the crop, modulates the bottleneck features with a
//! scale/shift derived from the motion coefficients, and decodes back to a
//! same-size face image. Reprojection ([`paste_back`]) touches only the
//! pixels inside the crop rectangle — everything outside stays byte-identical
//! to the source image.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use image::RgbImage;

use crate::config::COEFF_DIM;
use crate::face::{image_to_tensor, tensor_to_image, FaceGeometry};
use crate::model::audio2coeff::MotionCoefficientSequence;
use crate::{Error, Result};

/// Bottleneck channel count; the modulation produces a scale and shift pair
/// per channel.
const BOTTLENECK: usize = 64;

/// Coefficient-conditioned face generator.
pub struct FaceRenderer {
    enc1: Conv2d,
    enc2: Conv2d,
    mod_fc1: Linear,
    mod_fc2: Linear,
    dec1: Conv2d,
    dec2: Conv2d,
    device: Device,
}

impl FaceRenderer {
    /// Build the network from a [`VarBuilder`].
    ///
    /// Weight paths: `enc{1,2}`, `mod_fc{1,2}`, `dec{1,2}`, each with
    /// `weight`/`bias`.
    pub fn new(vb: VarBuilder, device: &Device) -> Result<Self> {
        let stride2 = Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let enc1 = conv2d(3, 32, 3, stride2, vb.pp("enc1"))?;
        let enc2 = conv2d(32, BOTTLENECK, 3, stride2, vb.pp("enc2"))?;
        let mod_fc1 = linear(COEFF_DIM, 128, vb.pp("mod_fc1"))?;
        let mod_fc2 = linear(128, 2 * BOTTLENECK, vb.pp("mod_fc2"))?;
        let dec1 = conv2d(BOTTLENECK, 32, 3, pad1, vb.pp("dec1"))?;
        let dec2 = conv2d(32, 3, 3, pad1, vb.pp("dec2"))?;
        Ok(Self {
            enc1,
            enc2,
            mod_fc1,
            mod_fc2,
            dec1,
            dec2,
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

    /// Render one face image (crop coordinates) per coefficient frame.
    ///
    /// Frame `i` of the output corresponds exactly to coefficient vector
    /// `i`. Batch size affects throughput only.
    pub fn render_faces(
        &self,
        crop: &RgbImage,
        coefficients: &MotionCoefficientSequence,
        batch_size: usize,
    ) -> Result<Vec<RgbImage>> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be >= 1".into()));
        }
        let (w, h) = crop.dimensions();
        if w != h || w % 4 != 0 {
            return Err(Error::Rendering(format!(
                "crop must be square with edge divisible by 4, got {w}x{h}"
            )));
        }

        let crop_tensor = image_to_tensor(crop, &self.device)?; // [1, 3, S, S]
        let mut faces = Vec::with_capacity(coefficients.len());

        let frames = coefficients.frames();
        for (batch_idx, batch) in frames.chunks(batch_size).enumerate() {
            let coeff_rows: Vec<Tensor> = batch
                .iter()
                .map(|frame| Tensor::from_slice(frame.as_slice(), (COEFF_DIM,), &self.device))
                .collect::<candle_core::Result<_>>()?;
            let coeffs = Tensor::stack(&coeff_rows, 0)?; // [B, COEFF_DIM]

            let b = batch.len();
            let crops = crop_tensor.expand((b, 3, h as usize, w as usize))?;
            let rendered = self.forward(&crops, &coeffs).map_err(|e| {
                Error::Rendering(format!("generator failed on batch {batch_idx}: {e}"))
            })?;

            for i in 0..b {
                let face = rendered.get(i)?;
                faces.push(tensor_to_image(&face)?);
            }
        }

        Ok(faces)
    }

    fn forward(&self, crops: &Tensor, coeffs: &Tensor) -> Result<Tensor> {
        let b = crops.dim(0)?;

        let feat = self.enc1.forward(crops)?.relu()?;
        let feat = self.enc2.forward(&feat)?.relu()?; // [B, 64, S/4, S/4]

        // Coefficient-conditioned feature modulation (per-channel scale/shift).
        let style = self.mod_fc1.forward(coeffs)?.relu()?;
        let style = self.mod_fc2.forward(&style)?; // [B, 2 * BOTTLENECK]
        let scale = style
            .narrow(1, 0, BOTTLENECK)?
            .reshape((b, BOTTLENECK, 1, 1))?;
        let shift = style
            .narrow(1, BOTTLENECK, BOTTLENECK)?
            .reshape((b, BOTTLENECK, 1, 1))?;
        let ones = Tensor::ones_like(&scale)?;
        let feat = feat
            .broadcast_mul(&(ones + scale)?)?
            .broadcast_add(&shift)?;

        let (_, _, fh, fw) = feat.dims4()?;
        let feat = feat.upsample_nearest2d(fh * 2, fw * 2)?;
        let feat = self.dec1.forward(&feat)?.relu()?;
        let (_, _, fh, fw) = feat.dims4()?;
        let feat = feat.upsample_nearest2d(fh * 2, fw * 2)?;
        let out = self.dec2.forward(&feat)?;
        Ok(candle_nn::ops::sigmoid(&out)?)
    }
}

/// Reproject a rendered face into the source image's coordinate space.
///
/// Every pixel inside the geometry's crop rectangle is bilinearly sampled
/// from the rendered face through the inverse crop transform; every pixel
/// outside the rectangle is copied from the source unchanged.
pub fn paste_back(
    source: &RgbImage,
    face: &RgbImage,
    geometry: &FaceGeometry,
) -> Result<RgbImage> {
    let (fw, fh) = face.dimensions();
    if (fw as usize, fh as usize) != (geometry.crop_size, geometry.crop_size) {
        return Err(Error::Rendering(format!(
            "rendered face is {fw}x{fh}, expected {0}x{0}",
            geometry.crop_size
        )));
    }

    let inverse = geometry.transform.inverse();
    let rect = geometry.rect;
    let mut out = source.clone();

    for y in rect.y0..rect.y0 + rect.side {
        for x in rect.x0..rect.x0 + rect.side {
            // Sample at the pixel center.
            let (cx, cy) = inverse.apply(x as f32 + 0.5, y as f32 + 0.5);
            let pixel = bilinear_sample(face, cx - 0.5, cy - 0.5);
            out.put_pixel(x, y, pixel);
        }
    }

    Ok(out)
}

/// Bilinear sample with edge clamping.
fn bilinear_sample(image: &RgbImage, x: f32, y: f32) -> image::Rgb<u8> {
    let (w, h) = image.dimensions();
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    image::Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreprocessMode;
    use crate::face::{crop_geometry, FaceBox};
    use candle_nn::VarMap;

    fn test_renderer() -> FaceRenderer {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        FaceRenderer::new(vb, &device).unwrap()
    }

    fn gradient_image(w: u32, h: u32) -> RgbImage {
        let mut img = RgbImage::new(w, h);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]);
        }
        img
    }

    fn test_geometry() -> FaceGeometry {
        let face = FaceBox {
            x0: 80.0,
            y0: 60.0,
            x1: 180.0,
            y1: 170.0,
            score: 0.9,
        };
        crop_geometry(320, 240, &face, PreprocessMode::Crop, 64)
    }

    fn coeff_sequence(n: usize) -> MotionCoefficientSequence {
        MotionCoefficientSequence::new(vec![vec![0.1f32; COEFF_DIM]; n])
    }

    #[test]
    fn one_face_per_coefficient_frame() {
        let renderer = test_renderer();
        let crop = gradient_image(64, 64);
        let faces = renderer.render_faces(&crop, &coeff_sequence(5), 2).unwrap();
        assert_eq!(faces.len(), 5);
        for face in &faces {
            assert_eq!(face.dimensions(), (64, 64));
        }
    }

    #[test]
    fn rendering_is_batch_invariant() {
        let renderer = test_renderer();
        let crop = gradient_image(64, 64);
        let seq = coeff_sequence(7);
        let a = renderer.render_faces(&crop, &seq, 1).unwrap();
        let b = renderer.render_faces(&crop, &seq, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn non_square_crop_is_rejected() {
        let renderer = test_renderer();
        let crop = gradient_image(64, 32);
        let err = renderer
            .render_faces(&crop, &coeff_sequence(1), 1)
            .unwrap_err();
        assert!(matches!(err, Error::Rendering(_)));
    }

    #[test]
    fn paste_back_preserves_background_bytes() {
        let source = gradient_image(320, 240);
        let geometry = test_geometry();
        let mut face = RgbImage::new(64, 64);
        for p in face.pixels_mut() {
            *p = image::Rgb([255, 0, 255]);
        }

        let out = paste_back(&source, &face, &geometry).unwrap();
        let r = geometry.rect;
        for (x, y, pixel) in out.enumerate_pixels() {
            let inside = x >= r.x0 && x < r.x0 + r.side && y >= r.y0 && y < r.y0 + r.side;
            if inside {
                assert_eq!(pixel.0, [255, 0, 255], "face pixel at ({x}, {y})");
            } else {
                assert_eq!(
                    pixel, source.get_pixel(x, y),
                    "background changed at ({x}, {y})"
                );
            }
        }
    }

    #[test]
    fn paste_back_rejects_wrong_face_size() {
        let source = gradient_image(320, 240);
        let geometry = test_geometry();
        let face = RgbImage::new(32, 32);
        assert!(matches!(
            paste_back(&source, &face, &geometry),
            Err(Error::Rendering(_))
        ));
    }

    #[test]
    fn bilinear_sample_at_integer_coords_is_exact() {
        let img = gradient_image(16, 16);
        let p = bilinear_sample(&img, 5.0, 9.0);
        assert_eq!(p, *img.get_pixel(5, 9));
    }

    #[test]
    fn bilinear_sample_interpolates_midpoint() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgb([0, 0, 0]));
        img.put_pixel(1, 0, image::Rgb([100, 200, 50]));
        let p = bilinear_sample(&img, 0.5, 0.0);
        assert_eq!(p.0, [50, 100, 25]);
    }
}
