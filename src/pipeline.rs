//! End-to-end talking-head inference pipeline.
//!
//! Orchestrates the full image + audio → video generation:
//! 1. Detect and crop the face, keeping the inverse transform
//! 2. Extract per-frame acoustic features from the driving audio
//! 3. Predict motion coefficients (one vector per video frame)
//! 4. Render each coefficient onto the crop and reproject into the source
//! 5. Optionally restore detail with the face enhancer
//! 6. Mux frames + original audio into the final video
//!
//! The flow is strictly linear: every stage persists its output under the
//! run's working directory before the next stage reads it. A failed stage
//! fails the whole run — there are no per-stage retries and never a partial
//! video. Failed runs leave their artifacts on disk for diagnosis.

use std::path::{Path, PathBuf};

use candle_core::Device;
use image::RgbImage;

use crate::artifacts::RunArtifacts;
use crate::audio::{extract_features, AudioClip};
use crate::config::{AudioConfig, PipelineOptions, FPS};
use crate::face::{FaceDetector, Preprocessor};
use crate::model::audio2coeff::{Audio2Coeff, MotionCoefficientSequence, PredictOptions};
use crate::model::enhancer::FaceEnhancer;
use crate::model::facerender::{paste_back, FaceRenderer};
use crate::model::ModelStore;
use crate::video::{assemble, ensure_ffmpeg};
use crate::{Error, Result};

/// Whether two paths name the same underlying file. Resolves symlinks and
/// `..` components through `canonicalize`; when either path does not exist
/// yet, canonicalization fails and the lexical comparison decides. Copying
/// a file onto itself truncates it, so the copy in `run_stages` is guarded
/// by this.
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Per-run pipeline state. Transitions are strictly forward; `Failed` is
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    Preprocessing,
    FeatureExtraction,
    CoefficientPrediction,
    Rendering,
    Enhancing,
    Assembling,
    Completed,
    Failed,
}

impl RunState {
    fn ordinal(&self) -> u8 {
        match self {
            RunState::Initialized => 0,
            RunState::Preprocessing => 1,
            RunState::FeatureExtraction => 2,
            RunState::CoefficientPrediction => 3,
            RunState::Rendering => 4,
            RunState::Enhancing => 5,
            RunState::Assembling => 6,
            RunState::Completed => 7,
            RunState::Failed => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Whether a transition to `next` is legal: strictly forward, with
    /// `Enhancing` optional, and `Failed` allowed from any non-terminal
    /// state.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunState::Failed {
            return true;
        }
        next.ordinal() > self.ordinal() && next != RunState::Initialized
    }

    /// The state after a run-level failure: terminal states are left
    /// untouched (a run that already completed stays completed), anything
    /// in flight becomes `Failed`.
    pub fn on_failure(self) -> RunState {
        if self.is_terminal() {
            self
        } else {
            RunState::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Initialized => "initialized",
            RunState::Preprocessing => "preprocessing",
            RunState::FeatureExtraction => "feature_extraction",
            RunState::CoefficientPrediction => "coefficient_prediction",
            RunState::Rendering => "rendering",
            RunState::Enhancing => "enhancing",
            RunState::Assembling => "assembling",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

/// Successful run summary.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub video_path: PathBuf,
    pub num_frames: usize,
    pub duration_s: f64,
    pub run_id: String,
}

/// The loaded pipeline: all model weights resident, shared read-only across
/// runs.
pub struct SadTalkerPipeline {
    options: PipelineOptions,
    audio_config: AudioConfig,
    preprocessor: Preprocessor,
    audio2coeff: Audio2Coeff,
    renderer: FaceRenderer,
    enhancer: Option<FaceEnhancer>,
    device: Device,
}

impl SadTalkerPipeline {
    /// Load every model required by `options` from the weight store.
    ///
    /// All configuration problems — invalid options, missing weights,
    /// missing ffmpeg — surface here, before any run starts.
    pub fn load(store: &ModelStore, device: &Device, options: PipelineOptions) -> Result<Self> {
        options.validate()?;
        ensure_ffmpeg()?;
        store.validate(options.enhancer)?;

        tracing::info!(
            root = %store.root().display(),
            size = options.size.pixels(),
            preprocess = options.preprocess.as_str(),
            enhancer = ?options.enhancer,
            "loading sadtalker pipeline"
        );

        let detector = FaceDetector::load(&store.detector_weights(), device)?;
        let audio2coeff = Audio2Coeff::load(&store.audio2coeff_weights(), device)?;
        let renderer = FaceRenderer::load(&store.facerender_weights(), device)?;
        let enhancer = if options.enhancer.is_enabled() {
            Some(FaceEnhancer::load(&store.enhancer_weights(), device)?)
        } else {
            None
        };

        Ok(Self {
            options,
            audio_config: AudioConfig::default(),
            preprocessor: Preprocessor::new(detector),
            audio2coeff,
            renderer,
            enhancer,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the full pipeline for one (image, audio) pair.
    ///
    /// Returns the final video path on success. On failure the run's
    /// artifacts stay in place and the error names the failed concern.
    pub async fn render_talking_head(
        &self,
        image_path: &Path,
        audio_path: &Path,
        artifacts: &RunArtifacts,
    ) -> Result<PipelineOutput> {
        let mut state = RunState::Initialized;
        let result = self
            .run_stages(image_path, audio_path, artifacts, &mut state)
            .await;

        match &result {
            Ok(output) => {
                tracing::info!(
                    run_id = artifacts.run_id(),
                    frames = output.num_frames,
                    video = %output.video_path.display(),
                    "run completed"
                );
            }
            Err(error) => {
                state = state.on_failure();
                tracing::error!(
                    run_id = artifacts.run_id(),
                    state = state.as_str(),
                    %error,
                    "run failed; artifacts retained at {}",
                    artifacts.dir().display()
                );
            }
        }
        result
    }

    async fn run_stages(
        &self,
        image_path: &Path,
        audio_path: &Path,
        artifacts: &RunArtifacts,
        state: &mut RunState,
    ) -> Result<PipelineOutput> {
        artifacts.ensure_layout()?;

        // --- Preprocessing ---
        self.advance(state, RunState::Preprocessing, artifacts)?;
        let source = image::open(image_path)?.to_rgb8();
        let (geometry, crop) =
            self.preprocessor
                .run(&source, self.options.preprocess, self.options.size.pixels())?;
        crop.save(artifacts.crop_png())?;

        // --- Feature extraction ---
        self.advance(state, RunState::FeatureExtraction, artifacts)?;
        let clip = AudioClip::load(audio_path)?;
        // Keep the driving audio co-located with the other intermediates;
        // the same file is later muxed, never re-decoded divergently.
        let speech_wav = artifacts.speech_wav();
        if !is_same_file(audio_path, &speech_wav) {
            std::fs::copy(audio_path, &speech_wav)?;
        }
        let features = extract_features(&clip, &self.audio_config, FPS)?;

        // --- Coefficient prediction ---
        self.advance(state, RunState::CoefficientPrediction, artifacts)?;
        let coefficients = self.audio2coeff.predict(
            &features,
            &PredictOptions {
                batch_size: self.options.batch_size,
                pose_style: self.options.pose_style,
                still: self.effective_still(),
            },
        )?;
        debug_assert_eq!(coefficients.len(), clip.num_frames(FPS));
        let dump = std::fs::File::create(artifacts.coeffs_json())?;
        serde_json::to_writer(std::io::BufWriter::new(dump), &coefficients)?;

        // --- Rendering ---
        self.advance(state, RunState::Rendering, artifacts)?;
        let frames_dir = artifacts.frames_dir();
        self.render_frames(&source, &crop, &geometry, &coefficients, &frames_dir)?;

        // --- Enhancing (optional) ---
        let final_dir = if let Some(enhancer) = &self.enhancer {
            self.advance(state, RunState::Enhancing, artifacts)?;
            let enhanced_dir = artifacts.enhanced_dir();
            for i in 0..coefficients.len() {
                let frame_path = RunArtifacts::frame_path(&frames_dir, i);
                let frame = image::open(&frame_path)?.to_rgb8();
                let enhanced = enhancer.enhance(&frame, self.options.enhancer_strength)?;
                enhanced.save(RunArtifacts::frame_path(&enhanced_dir, i))?;
            }
            enhanced_dir
        } else {
            frames_dir
        };

        // --- Assembly ---
        self.advance(state, RunState::Assembling, artifacts)?;
        let video_path = artifacts.video_path();
        assemble(&final_dir, &speech_wav, &video_path).await?;

        self.advance(state, RunState::Completed, artifacts)?;
        artifacts.cleanup_intermediates()?;

        Ok(PipelineOutput {
            video_path,
            num_frames: coefficients.len(),
            duration_s: clip.duration_secs(),
            run_id: artifacts.run_id().to_string(),
        })
    }

    fn render_frames(
        &self,
        source: &RgbImage,
        crop: &RgbImage,
        geometry: &crate::face::FaceGeometry,
        coefficients: &MotionCoefficientSequence,
        frames_dir: &Path,
    ) -> Result<()> {
        let faces = self
            .renderer
            .render_faces(crop, coefficients, self.options.batch_size)?;
        if faces.len() != coefficients.len() {
            return Err(Error::Rendering(format!(
                "rendered {} faces for {} coefficient frames",
                faces.len(),
                coefficients.len()
            )));
        }
        for (i, face) in faces.iter().enumerate() {
            let frame = paste_back(source, face, geometry)?;
            frame.save(RunArtifacts::frame_path(frames_dir, i))?;
        }
        Ok(())
    }

    /// The `full` preprocess mode implies a still head, matching the
    /// original CLI behavior; `extfull` animates the pose normally.
    fn effective_still(&self) -> bool {
        self.options.still || self.options.preprocess.implies_still()
    }

    fn advance(&self, state: &mut RunState, next: RunState, artifacts: &RunArtifacts) -> Result<()> {
        if !state.can_advance_to(next) {
            return Err(Error::Manager(format!(
                "illegal state transition {} -> {}",
                state.as_str(),
                next.as_str()
            )));
        }
        tracing::info!(
            run_id = artifacts.run_id(),
            from = state.as_str(),
            to = next.as_str(),
            "stage transition"
        );
        *state = next;
        Ok(())
    }
}
