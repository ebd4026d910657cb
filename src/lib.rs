//! SadTalker-style talking-head generation in pure Rust.
//!
//! Turns one still portrait image and one speech waveform into a lip-synced
//! talking-head video. A candle-based implementation loading safetensors
//! weights from a local checkpoint directory.
//!
//! ## Architecture
//!
//! The pipeline is strictly linear per run:
//!
//! ```text
//! image → face detector ──→ (normalized crop, inverse transform)
//!                                          │
//! audio → mel features → audio2coeff ──→ motion coefficients (25 fps)
//!                                          │
//!                              face renderer + paste-back
//!                                          │
//!                              [GFPGAN enhancer (optional)]
//!                                          │
//!                              ffmpeg mux (frames + audio) → video
//! ```
//!
//! ## Modules
//!
//! - [`audio`] — WAV I/O, resampling, mel spectrogram feature chunks
//! - [`face`] — detection, crop geometry, inverse transform
//! - [`model`] — coefficient predictor, renderer, enhancer, weight store
//! - [`pipeline`] — end-to-end orchestrator and run state machine
//! - [`artifacts`] — per-run working directory layout and lifecycle
//! - [`manager`] — resident pipeline with a sequential run queue
//! - [`tts`] — external Piper speech synthesis collaborator
//! - [`video`] — ffmpeg frame/audio muxing

pub mod artifacts;
pub mod audio;
pub mod config;
pub mod face;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod tts;
pub mod video;

mod error;

pub use error::{Error, Result};
