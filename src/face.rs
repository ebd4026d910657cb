//! Face preprocessing: detection, crop geometry, and the inverse transform
//! used to reproject rendered faces back onto the source image.
//!
//! Exactly one face is expected per source image. Zero detections fail the
//! run with [`Error::NoFaceDetected`]; multiple detections resolve
//! deterministically to the largest box (tie-break: leftmost). The
//! preprocessing mode changes only the crop geometry, never the detection.

mod detector;

pub use detector::{
    image_to_tensor, non_max_suppression, select_primary, tensor_to_image, FaceBox, FaceDetector,
};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::PreprocessMode;
use crate::{Error, Result};

/// Uniform scale + translation mapping crop pixels to original pixels:
/// `x_orig = x_crop * scale + tx`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropTransform {
    pub scale: f32,
    pub tx: f32,
    pub ty: f32,
}

impl CropTransform {
    /// Apply the transform to a point in crop coordinates.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.tx, y * self.scale + self.ty)
    }

    /// The exact inverse mapping (original → crop coordinates).
    pub fn inverse(&self) -> CropTransform {
        CropTransform {
            scale: 1.0 / self.scale,
            tx: -self.tx / self.scale,
            ty: -self.ty / self.scale,
        }
    }
}

/// The square crop region in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x0: u32,
    pub y0: u32,
    pub side: u32,
}

/// Result of preprocessing one source image.
///
/// Owned exclusively by the run that produced it and discarded after
/// rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceGeometry {
    /// The selected detection, original-image coordinates.
    pub bbox: (f32, f32, f32, f32),
    /// Five canonical landmarks (eyes, nose tip, mouth corners),
    /// original-image coordinates.
    pub landmarks: Vec<(f32, f32)>,
    /// The square region the normalized crop was taken from.
    pub rect: CropRect,
    /// Crop → original transform; `transform.inverse()` goes the other way.
    pub transform: CropTransform,
    /// Edge length of the normalized crop in pixels.
    pub crop_size: usize,
}

/// Derive the square crop region and transform for a detected face.
///
/// The square is sized from the face box plus the mode's padding factor,
/// clamped to fit entirely inside the image (shifted, then shrunk only if
/// it exceeds the image's shorter edge). Every crop pixel therefore maps
/// back inside the original image.
pub fn crop_geometry(
    image_w: u32,
    image_h: u32,
    face: &FaceBox,
    mode: PreprocessMode,
    crop_size: usize,
) -> FaceGeometry {
    let (cx, cy) = face.center();
    let half = face.width().max(face.height()) / 2.0 * (1.0 + mode.padding_factor());

    let max_side = image_w.min(image_h);
    let side = (((half * 2.0).round() as u32).max(2)).min(max_side);

    let x0 = ((cx - side as f32 / 2.0).round() as i64)
        .clamp(0, (image_w - side) as i64) as u32;
    let y0 = ((cy - side as f32 / 2.0).round() as i64)
        .clamp(0, (image_h - side) as i64) as u32;

    let transform = CropTransform {
        scale: side as f32 / crop_size as f32,
        tx: x0 as f32,
        ty: y0 as f32,
    };

    // Canonical 5-point landmarks at fixed fractions of the face box.
    let (bw, bh) = (face.width(), face.height());
    let landmarks = [
        (0.30, 0.40),
        (0.70, 0.40),
        (0.50, 0.60),
        (0.35, 0.78),
        (0.65, 0.78),
    ]
    .iter()
    .map(|(fx, fy)| (face.x0 + fx * bw, face.y0 + fy * bh))
    .collect();

    FaceGeometry {
        bbox: (face.x0, face.y0, face.x1, face.y1),
        landmarks,
        rect: CropRect { x0, y0, side },
        transform,
        crop_size,
    }
}

/// Detects the face and produces the normalized crop plus geometry.
pub struct Preprocessor {
    detector: FaceDetector,
}

impl Preprocessor {
    pub fn new(detector: FaceDetector) -> Self {
        Self { detector }
    }

    /// Run detection and cropping. No files are written.
    pub fn run(
        &self,
        image: &RgbImage,
        mode: PreprocessMode,
        crop_size: usize,
    ) -> Result<(FaceGeometry, RgbImage)> {
        let boxes = self.detector.detect(image)?;
        let face = select_primary(&boxes).ok_or(Error::NoFaceDetected)?;
        tracing::debug!(
            candidates = boxes.len(),
            score = face.score,
            area = face.area(),
            mode = mode.as_str(),
            "selected primary face"
        );

        let geometry = crop_geometry(image.width(), image.height(), &face, mode, crop_size);
        let crop = extract_crop(image, &geometry);
        Ok((geometry, crop))
    }
}

/// Cut the geometry's square region out of the image and resample it to the
/// normalized crop size.
pub fn extract_crop(image: &RgbImage, geometry: &FaceGeometry) -> RgbImage {
    let r = geometry.rect;
    let view = image::imageops::crop_imm(image, r.x0, r.y0, r.side, r.side).to_image();
    image::imageops::resize(
        &view,
        geometry.crop_size as u32,
        geometry.crop_size as u32,
        image::imageops::FilterType::Lanczos3,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x0: f32, y0: f32, w: f32, h: f32) -> FaceBox {
        FaceBox {
            x0,
            y0,
            x1: x0 + w,
            y1: y0 + h,
            score: 0.9,
        }
    }

    #[test]
    fn transform_inverse_roundtrip() {
        let t = CropTransform {
            scale: 1.75,
            tx: 120.0,
            ty: 44.0,
        };
        let inv = t.inverse();
        let (ox, oy) = t.apply(100.0, 200.0);
        let (cx, cy) = inv.apply(ox, oy);
        assert!((cx - 100.0).abs() < 1e-3);
        assert!((cy - 200.0).abs() < 1e-3);
    }

    #[test]
    fn crop_pixels_map_inside_original() {
        for mode in [
            PreprocessMode::Crop,
            PreprocessMode::Full,
            PreprocessMode::ExtFull,
        ] {
            let g = crop_geometry(640, 480, &face(500.0, 300.0, 150.0, 160.0), mode, 256);
            for &(x, y) in &[(0.0, 0.0), (255.0, 255.0), (0.0, 255.0), (128.0, 37.0)] {
                let (ox, oy) = g.transform.apply(x, y);
                assert!(
                    (0.0..=640.0).contains(&ox) && (0.0..=480.0).contains(&oy),
                    "mode {mode:?}: crop ({x}, {y}) mapped outside to ({ox}, {oy})"
                );
            }
        }
    }

    #[test]
    fn crop_rect_fits_image() {
        // Face near the corner of a small image.
        let g = crop_geometry(
            200,
            100,
            &face(180.0, 80.0, 30.0, 30.0),
            PreprocessMode::ExtFull,
            256,
        );
        assert!(g.rect.x0 + g.rect.side <= 200);
        assert!(g.rect.y0 + g.rect.side <= 100);
    }

    #[test]
    fn modes_only_change_geometry() {
        let f = face(200.0, 150.0, 100.0, 100.0);
        let tight = crop_geometry(640, 480, &f, PreprocessMode::Crop, 256);
        let ext = crop_geometry(640, 480, &f, PreprocessMode::ExtFull, 256);
        assert!(ext.rect.side > tight.rect.side);
        // Landmarks come from the detection and are mode-independent.
        assert_eq!(tight.landmarks, ext.landmarks);
        assert_eq!(tight.bbox, ext.bbox);
    }

    #[test]
    fn landmarks_lie_inside_face_box() {
        let f = face(100.0, 100.0, 80.0, 90.0);
        let g = crop_geometry(640, 480, &f, PreprocessMode::Crop, 256);
        assert_eq!(g.landmarks.len(), 5);
        for &(x, y) in &g.landmarks {
            assert!(x >= f.x0 && x <= f.x1);
            assert!(y >= f.y0 && y <= f.y1);
        }
    }

    #[test]
    fn zero_detections_report_no_face() {
        use candle_core::{DType, Device};
        use candle_nn::{VarBuilder, VarMap};

        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let detector = FaceDetector::new(vb, &device).unwrap();
        // Zero every weight: all logits become 0, sigmoid(0) = 0.5 sits
        // below the score threshold, so no candidate survives decoding.
        for var in varmap.all_vars() {
            var.set(&var.zeros_like().unwrap()).unwrap();
        }

        let preprocessor = Preprocessor::new(detector);
        let image = RgbImage::new(320, 240);
        let err = preprocessor
            .run(&image, PreprocessMode::Crop, 256)
            .unwrap_err();
        assert!(matches!(err, Error::NoFaceDetected));
    }

    #[test]
    fn extract_crop_has_requested_size() {
        let mut img = RgbImage::new(320, 240);
        for p in img.pixels_mut() {
            *p = image::Rgb([10, 20, 30]);
        }
        let g = crop_geometry(
            320,
            240,
            &face(100.0, 80.0, 60.0, 60.0),
            PreprocessMode::Crop,
            256,
        );
        let crop = extract_crop(&img, &g);
        assert_eq!(crop.dimensions(), (256, 256));
        assert_eq!(crop.get_pixel(128, 128).0, [10, 20, 30]);
    }
}
