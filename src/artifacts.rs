//! On-disk layout and lifecycle for one pipeline run.
//!
//! Each run owns a working directory holding every intermediate artifact.
//! Generated directories live at `<result_root>/<run_id>/<timestamp>/` and
//! may be cleaned up after the final video is written; caller-supplied
//! directories (used to co-locate intermediates with an externally managed
//! speech file) are never cleaned. The final video sits next to the working
//! directory and is never auto-deleted.
//!
//! ```text
//! <result_root>/<run_id>/
//!   <timestamp>/            working directory
//!     speech.wav            synthesized or copied driving audio
//!     crop.png              normalized face crop
//!     coeffs.json           motion coefficient dump
//!     frames/%06d.png       raw rendered frames
//!     enhanced/%06d.png     enhanced frames (enhancer runs only)
//!   <timestamp>.mp4         final video
//! ```

use std::path::{Path, PathBuf};

use crate::Result;

/// Working directory handle for one run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    run_id: String,
    work_dir: PathBuf,
    caller_supplied: bool,
}

impl RunArtifacts {
    /// Create a fresh generated working directory under `result_root`.
    pub fn create(result_root: impl AsRef<Path>) -> Result<Self> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Local::now().format("%Y_%m_%d_%H.%M.%S").to_string();
        let work_dir = result_root.as_ref().join(&run_id).join(timestamp);
        std::fs::create_dir_all(&work_dir)?;
        tracing::debug!(run_id, dir = %work_dir.display(), "created run directory");
        Ok(Self {
            run_id,
            work_dir,
            caller_supplied: false,
        })
    }

    /// Adopt a caller-supplied working directory (creating it if needed).
    ///
    /// The caller owns cleanup; [`RunArtifacts::cleanup_intermediates`]
    /// becomes a no-op.
    pub fn at(dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = dir.into();
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            work_dir,
            caller_supplied: true,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn is_caller_supplied(&self) -> bool {
        self.caller_supplied
    }

    // --- Documented subpaths ---

    pub fn speech_wav(&self) -> PathBuf {
        self.work_dir.join("speech.wav")
    }

    pub fn crop_png(&self) -> PathBuf {
        self.work_dir.join("crop.png")
    }

    pub fn coeffs_json(&self) -> PathBuf {
        self.work_dir.join("coeffs.json")
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.work_dir.join("frames")
    }

    pub fn enhanced_dir(&self) -> PathBuf {
        self.work_dir.join("enhanced")
    }

    /// Path of frame `index` inside `dir` (ffmpeg-compatible numbering).
    pub fn frame_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("{index:06}.png"))
    }

    /// Final video path: a sibling of the working directory named after it.
    ///
    /// Never auto-deleted. Built by appending `.mp4` to the directory name
    /// (the timestamp itself contains dots, so `with_extension` would
    /// truncate it).
    pub fn video_path(&self) -> PathBuf {
        let name = self
            .work_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.run_id.clone());
        match self.work_dir.parent() {
            Some(parent) => parent.join(format!("{name}.mp4")),
            None => PathBuf::from(format!("{name}.mp4")),
        }
    }

    /// Create the frame output directories.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.frames_dir())?;
        std::fs::create_dir_all(self.enhanced_dir())?;
        Ok(())
    }

    /// Delete the intermediates of a successful generated run.
    ///
    /// Caller-supplied directories are left untouched; the final video is
    /// outside the working directory and survives either way. Failed runs
    /// must not call this — their artifacts stay on disk for diagnosis.
    pub fn cleanup_intermediates(&self) -> Result<()> {
        if self.caller_supplied {
            tracing::debug!(run_id = self.run_id, "caller-supplied dir, skipping cleanup");
            return Ok(());
        }
        if self.work_dir.exists() {
            std::fs::remove_dir_all(&self.work_dir)?;
            tracing::debug!(run_id = self.run_id, "removed intermediate artifacts");
        }
        Ok(())
    }
}
