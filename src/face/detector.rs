//! Face detection.
//!
//! A small single-shot conv detector over a letterboxed 256x256 input. The
//! backbone downsamples to an 8x8 grid; each cell predicts an objectness
//! score and a box (center offset + log-size) relative to a fixed anchor.
//! Decoding and non-maximum suppression are pure functions so the selection
//! behavior is testable without weights.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use image::RgbImage;

use crate::{Error, Result};

/// Letterboxed detector input edge length.
pub const DETECT_INPUT: usize = 256;
/// Detector output grid edge length (input / 32).
const GRID: usize = 8;
/// Anchor box edge in input pixels.
const ANCHOR: f32 = 64.0;
/// Minimum objectness score for a candidate box.
const SCORE_THRESHOLD: f32 = 0.6;
/// IoU above which overlapping candidates are suppressed.
const NMS_IOU: f32 = 0.4;

/// An axis-aligned detection in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub score: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let ix0 = self.x0.max(other.x0);
        let iy0 = self.y0.max(other.y0);
        let ix1 = self.x1.min(other.x1);
        let iy1 = self.y1.min(other.y1);
        let inter = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Select one face deterministically: largest bounding box, tie-break
/// leftmost (smaller x0 wins at equal area).
pub fn select_primary(boxes: &[FaceBox]) -> Option<FaceBox> {
    boxes
        .iter()
        .copied()
        .max_by(|a, b| {
            a.area()
                .partial_cmp(&b.area())
                .unwrap_or(std::cmp::Ordering::Equal)
                // Reversed x0: at equal area the smaller x0 must compare greater.
                .then(
                    b.x0.partial_cmp(&a.x0)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        })
}

/// Greedy non-maximum suppression, highest score first.
pub fn non_max_suppression(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Single-shot face detector.
pub struct FaceDetector {
    convs: Vec<Conv2d>,
    head: Conv2d,
    device: Device,
}

impl FaceDetector {
    /// Build the network from a [`VarBuilder`].
    ///
    /// Weight paths: `backbone.{0..4}.{weight,bias}`, `head.{weight,bias}`.
    pub fn new(vb: VarBuilder, device: &Device) -> Result<Self> {
        let stride2 = Conv2dConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let channels = [3usize, 16, 32, 64, 64, 128];
        let mut convs = Vec::with_capacity(channels.len() - 1);
        for i in 0..channels.len() - 1 {
            convs.push(conv2d(
                channels[i],
                channels[i + 1],
                3,
                stride2,
                vb.pp(format!("backbone.{i}")),
            )?);
        }
        let head = conv2d(128, 5, 1, Default::default(), vb.pp("head"))?;
        Ok(Self {
            convs,
            head,
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

    /// Detect faces, returning boxes in original-image pixel coordinates.
    ///
    /// An empty result means no face cleared the score threshold; the caller
    /// maps that to [`Error::NoFaceDetected`].
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<FaceBox>> {
        let (letterboxed, scale, pad_x, pad_y) = letterbox(image, DETECT_INPUT);
        let input = image_to_tensor(&letterboxed, &self.device)?;
        let raw = self.forward(&input)?;
        let grid: Vec<f32> = raw.flatten_all()?.to_vec1()?;

        let candidates = decode_grid(&grid, GRID, DETECT_INPUT as f32, ANCHOR, SCORE_THRESHOLD);
        let kept = non_max_suppression(candidates, NMS_IOU);

        // Map from letterboxed input coordinates back to the original image.
        let (w, h) = (image.width() as f32, image.height() as f32);
        let boxes = kept
            .into_iter()
            .map(|b| FaceBox {
                x0: ((b.x0 - pad_x) / scale).clamp(0.0, w),
                y0: ((b.y0 - pad_y) / scale).clamp(0.0, h),
                x1: ((b.x1 - pad_x) / scale).clamp(0.0, w),
                y1: ((b.y1 - pad_y) / scale).clamp(0.0, h),
                score: b.score,
            })
            .filter(|b| b.area() > 1.0)
            .collect();
        Ok(boxes)
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut xs = input.clone();
        for conv in &self.convs {
            xs = conv.forward(&xs)?.relu()?;
        }
        Ok(self.head.forward(&xs)?)
    }
}

/// Decode the raw `[5, grid, grid]` head output into candidate boxes in
/// input-pixel coordinates.
pub fn decode_grid(
    raw: &[f32],
    grid: usize,
    input_size: f32,
    anchor: f32,
    score_threshold: f32,
) -> Vec<FaceBox> {
    let plane = grid * grid;
    debug_assert_eq!(raw.len(), 5 * plane);
    let cell = input_size / grid as f32;

    let mut boxes = Vec::new();
    for gy in 0..grid {
        for gx in 0..grid {
            let idx = gy * grid + gx;
            let score = sigmoid(raw[idx]);
            if score <= score_threshold {
                continue;
            }
            let dx = raw[plane + idx].tanh();
            let dy = raw[2 * plane + idx].tanh();
            let dw = raw[3 * plane + idx];
            let dh = raw[4 * plane + idx];

            let cx = (gx as f32 + 0.5 + dx) * cell;
            let cy = (gy as f32 + 0.5 + dy) * cell;
            let w = anchor * dw.clamp(-3.0, 3.0).exp();
            let h = anchor * dh.clamp(-3.0, 3.0).exp();

            boxes.push(FaceBox {
                x0: cx - w / 2.0,
                y0: cy - h / 2.0,
                x1: cx + w / 2.0,
                y1: cy + h / 2.0,
                score,
            });
        }
    }
    boxes
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Resize keeping aspect ratio onto a square canvas, padding with black.
/// Returns (canvas, scale, pad_x, pad_y) where
/// `input_coord = original_coord * scale + pad`.
fn letterbox(image: &RgbImage, size: usize) -> (RgbImage, f32, f32, f32) {
    let (w, h) = (image.width(), image.height());
    let scale = size as f32 / w.max(h) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    let resized =
        image::imageops::resize(image, new_w, new_h, image::imageops::FilterType::Triangle);
    let pad_x = (size as u32 - new_w) / 2;
    let pad_y = (size as u32 - new_h) / 2;
    let mut canvas = RgbImage::new(size as u32, size as u32);
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);
    (canvas, scale, pad_x as f32, pad_y as f32)
}

/// Convert an RGB image to a `[1, 3, H, W]` tensor normalized to [0, 1].
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut data = vec![0f32; 3 * h * w];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            data[c * h * w + y * w + x] = pixel.0[c] as f32 / 255.0;
        }
    }
    Ok(Tensor::from_vec(data, (1, 3, h, w), device)?)
}

/// Convert a `[3, H, W]` tensor in [0, 1] back to an RGB image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (c, h, w) = tensor.dims3()?;
    if c != 3 {
        return Err(Error::Rendering(format!(
            "expected 3-channel tensor, got {c}"
        )));
    }
    let data: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
    let mut image = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let mut px = [0u8; 3];
            for (ch, slot) in px.iter_mut().enumerate() {
                let v = data[ch * h * w + y * w + x];
                if !v.is_finite() {
                    return Err(Error::Rendering(format!(
                        "non-finite pixel value at ({x}, {y})"
                    )));
                }
                *slot = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            image.put_pixel(x as u32, y as u32, image::Rgb(px));
        }
    }
    Ok(image)
}
