//! SadTalker CLI — single-image talking-head video generation.
//!
//! Drives the pipeline with either a pre-recorded WAV (`--driven-audio`) or
//! a text string synthesized through the external Piper TTS (`--text` +
//! `--voice`). Model weights are read from a local checkpoint directory.
//!
//! # Output
//!
//! Writes one video file under `--result-dir` (or next to `--save-dir` when
//! given) and prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"results/<id>/<ts>.mp4","frames":25,"duration_s":1.0}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use clap::Parser;
use sadtalker_rs::artifacts::RunArtifacts;
use sadtalker_rs::config::{EnhancerKind, FrameSize, PipelineOptions, PreprocessMode};
use sadtalker_rs::manager::preferred_device;
use sadtalker_rs::model::ModelStore;
use sadtalker_rs::pipeline::SadTalkerPipeline;
use sadtalker_rs::tts::Synthesizer;

#[derive(Parser, Debug)]
#[command(
    name = "sadtalker",
    about = "Single-image talking-head video generation",
    long_about = "Generate a lip-synced talking-head video from one portrait image\n\
                  and one speech waveform (or a text string synthesized via Piper).\n\
                  Model weights are loaded from --checkpoints; the video is written\n\
                  under --result-dir and a JSON summary line is printed to stdout."
)]
struct Args {
    /// Source portrait image (png/jpg).
    #[arg(long, short = 'i')]
    source_image: PathBuf,

    /// Driving audio WAV. Mutually exclusive with --text.
    #[arg(long, short = 'a', conflicts_with = "text")]
    driven_audio: Option<PathBuf>,

    /// Text to synthesize with Piper instead of --driven-audio.
    #[arg(long, requires = "voice")]
    text: Option<String>,

    /// Piper voice model (.onnx), required with --text.
    #[arg(long)]
    voice: Option<PathBuf>,

    /// Root directory for generated run artifacts.
    #[arg(long, default_value = "results")]
    result_dir: PathBuf,

    /// Explicit working directory; intermediates (including the synthesized
    /// wav) co-locate here and are never auto-deleted.
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Model weight directory.
    #[arg(long, default_value = "checkpoints")]
    checkpoints: PathBuf,

    /// Face crop resolution.
    #[arg(long, default_value = "256")]
    size: String,

    /// Image preprocessing mode.
    #[arg(long, default_value = "crop")]
    preprocess: String,

    /// Inference batch size (throughput only; never changes the output).
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Face enhancer: none|gfpgan.
    #[arg(long, default_value = "none")]
    enhancer: String,

    /// Head-pose style seed (0 = neutral).
    #[arg(long, default_value_t = 0)]
    pose_style: u8,

    /// Keep the head still (implied by --preprocess full).
    #[arg(long)]
    still: bool,

    /// CUDA device ordinal; falls back to CPU when unavailable.
    #[arg(long, default_value_t = 0)]
    cuda_device: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let options = PipelineOptions {
        preprocess: args.preprocess.parse::<PreprocessMode>()?,
        size: args.size.parse::<FrameSize>()?,
        enhancer: args.enhancer.parse::<EnhancerKind>()?,
        batch_size: args.batch_size,
        pose_style: args.pose_style,
        still: args.still,
        ..Default::default()
    };

    let device = preferred_device(args.cuda_device);
    let store = ModelStore::new(&args.checkpoints);
    let pipeline = SadTalkerPipeline::load(&store, &device, options)?;

    let artifacts = match &args.save_dir {
        Some(dir) => RunArtifacts::at(dir)?,
        None => RunArtifacts::create(&args.result_dir)?,
    };

    // Resolve the driving audio: a provided WAV, or Piper synthesis into
    // the run's working directory.
    let audio_path = match (&args.driven_audio, &args.text) {
        (Some(path), _) => path.clone(),
        (None, Some(text)) => {
            let voice = args.voice.as_ref().expect("clap enforces --voice");
            let synth = Synthesizer::new(voice);
            synth.validate()?;
            let out = artifacts.speech_wav();
            synth.speak(text, &out).await?;
            out
        }
        (None, None) => anyhow::bail!("either --driven-audio or --text is required"),
    };

    let output = pipeline
        .render_talking_head(&args.source_image, &audio_path, &artifacts)
        .await?;

    println!(
        "{}",
        serde_json::json!({
            "path": output.video_path,
            "frames": output.num_frames,
            "duration_s": output.duration_s,
        })
    );
    Ok(())
}
