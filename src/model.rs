//! Learned model stages and the on-disk weight store.
//!
//! ## Components
//!
//! - [`audio2coeff`] — acoustic features → motion coefficients
//! - [`facerender`] — motion coefficients + face crop → rendered frames
//! - [`enhancer`] — optional face restoration post-process
//!
//! Each stage sits behind a narrow typed contract (sequences in, sequences
//! out); the orchestrator never depends on a stage's internal structure.
//! Weights are loaded once per process from a read-only [`ModelStore`] and
//! shared by reference across runs.

pub mod audio2coeff;
pub mod enhancer;
pub mod facerender;

use std::path::{Path, PathBuf};

use crate::config::EnhancerKind;
use crate::{Error, Result};

/// Read-only directory tree supplying model weights.
///
/// Expected layout under the root:
///
/// ```text
/// checkpoints/
///   detector.safetensors      face detection
///   audio2coeff.safetensors   coefficient predictor
///   facerender.safetensors    motion renderer
///   gfpgan.safetensors        enhancer (only if requested)
/// ```
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn detector_weights(&self) -> PathBuf {
        self.root.join("detector.safetensors")
    }

    pub fn audio2coeff_weights(&self) -> PathBuf {
        self.root.join("audio2coeff.safetensors")
    }

    pub fn facerender_weights(&self) -> PathBuf {
        self.root.join("facerender.safetensors")
    }

    pub fn enhancer_weights(&self) -> PathBuf {
        self.root.join("gfpgan.safetensors")
    }

    /// Verify that every weight file required by the configuration exists.
    ///
    /// Called once before any stage runs; a missing file is a configuration
    /// error, never a mid-run failure.
    pub fn validate(&self, enhancer: EnhancerKind) -> Result<()> {
        let mut required = vec![
            self.detector_weights(),
            self.audio2coeff_weights(),
            self.facerender_weights(),
        ];
        if enhancer.is_enabled() {
            required.push(self.enhancer_weights());
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|p| !p.is_file())
            .map(|p| p.display().to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "missing model weights: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"stub").unwrap();
    }

    #[test]
    fn validate_reports_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let err = store.validate(EnhancerKind::None).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("detector.safetensors"));
    }

    #[test]
    fn validate_passes_with_core_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        touch(&store.detector_weights());
        touch(&store.audio2coeff_weights());
        touch(&store.facerender_weights());
        assert!(store.validate(EnhancerKind::None).is_ok());
    }

    #[test]
    fn enhancer_weights_checked_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        touch(&store.detector_weights());
        touch(&store.audio2coeff_weights());
        touch(&store.facerender_weights());

        assert!(store.validate(EnhancerKind::None).is_ok());
        let err = store.validate(EnhancerKind::Gfpgan).unwrap_err();
        assert!(err.to_string().contains("gfpgan.safetensors"));

        touch(&store.enhancer_weights());
        assert!(store.validate(EnhancerKind::Gfpgan).is_ok());
    }
}
