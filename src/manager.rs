//! Pipeline manager — keeps the models resident and queues runs.
//!
//! The manager owns one loaded [`SadTalkerPipeline`] and processes submitted
//! runs sequentially on a dedicated worker task. Model weights are loaded
//! once at startup and shared read-only across every run; each run still
//! owns its own artifact directory, so independent managers (or external
//! processes) can operate concurrently without sharing mutable state.
//!
//! # Example
//!
//! ```no_run
//! use sadtalker_rs::config::PipelineOptions;
//! use sadtalker_rs::manager::{ManagerConfig, PipelineManager, RunRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = PipelineManager::start(ManagerConfig::default()).await.unwrap();
//!     let output = manager
//!         .submit(RunRequest {
//!             image: "avatar.png".into(),
//!             audio: "speech.wav".into(),
//!             result_root: "results".into(),
//!             work_dir: None,
//!         })
//!         .await
//!         .unwrap();
//!     println!("{}", output.video_path.display());
//! }
//! ```

use std::path::PathBuf;

use candle_core::Device;
use tokio::sync::{mpsc, oneshot};

use crate::artifacts::RunArtifacts;
use crate::config::PipelineOptions;
use crate::model::ModelStore;
use crate::pipeline::{PipelineOutput, SadTalkerPipeline};
use crate::{Error, Result};

/// Configuration for the pipeline manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Weight store root directory.
    pub checkpoints: PathBuf,
    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,
    /// Pipeline options shared by every queued run.
    pub options: PipelineOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            checkpoints: PathBuf::from("checkpoints"),
            cuda_device: 0,
            options: PipelineOptions::default(),
        }
    }
}

/// One queued run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image: PathBuf,
    pub audio: PathBuf,
    /// Root under which a generated run directory is created.
    pub result_root: PathBuf,
    /// Explicit caller-managed working directory; overrides `result_root`.
    pub work_dir: Option<PathBuf>,
}

struct PendingRun {
    request: RunRequest,
    reply: oneshot::Sender<Result<PipelineOutput>>,
}

/// Handle for submitting runs to a running manager.
#[derive(Clone, Debug)]
pub struct PipelineManager {
    tx: mpsc::Sender<PendingRun>,
}

impl PipelineManager {
    /// Load the pipeline and start the worker task.
    ///
    /// Loading happens on a blocking thread (weight mmap + graph
    /// construction); a load failure is returned here, before any run is
    /// accepted.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        let pipeline = tokio::task::spawn_blocking(move || -> Result<SadTalkerPipeline> {
            let device = preferred_device(config.cuda_device);
            tracing::info!(device = ?device, "loading sadtalker pipeline");
            let store = ModelStore::new(&config.checkpoints);
            SadTalkerPipeline::load(&store, &device, config.options)
        })
        .await
        .map_err(|join_error| Error::Manager(format!("pipeline load task panicked: {join_error}")))??;

        let (tx, rx) = mpsc::channel::<PendingRun>(16);
        tokio::spawn(run_manager(pipeline, rx));

        Ok(Self { tx })
    }

    /// Submit a run and wait for its result.
    pub async fn submit(&self, request: RunRequest) -> Result<PipelineOutput> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<PipelineOutput>>();
        self.tx
            .send(PendingRun {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }
}

/// The worker loop — processes runs strictly sequentially.
async fn run_manager(pipeline: SadTalkerPipeline, mut rx: mpsc::Receiver<PendingRun>) {
    while let Some(pending) = rx.recv().await {
        let result = execute(&pipeline, &pending.request).await;
        // Ignore send errors — the caller may have given up waiting.
        let _ = pending.reply.send(result);
    }
    tracing::info!("pipeline manager shut down");
}

async fn execute(pipeline: &SadTalkerPipeline, request: &RunRequest) -> Result<PipelineOutput> {
    let artifacts = match &request.work_dir {
        Some(dir) => RunArtifacts::at(dir)?,
        None => RunArtifacts::create(&request.result_root)?,
    };
    pipeline
        .render_talking_head(&request.image, &request.audio, &artifacts)
        .await
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.cuda_device, 0);
        assert_eq!(config.checkpoints, PathBuf::from("checkpoints"));
        assert_eq!(config.options.batch_size, 1);
    }

    #[tokio::test]
    async fn start_fails_fast_on_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagerConfig {
            checkpoints: dir.path().join("nonexistent"),
            ..Default::default()
        };
        let err = PipelineManager::start(config).await.unwrap_err();
        // Either the weights or ffmpeg are reported missing; both are
        // configuration errors detected before any run.
        assert!(err.is_configuration());
    }
}
