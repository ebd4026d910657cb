//! Video assembly: mux a rendered frame sequence with the driving audio.
//!
//! ffmpeg is invoked as an external command. The builder keeps input and
//! output arguments separate (everything before vs. after `-i`) and runs
//! with `-v error` so stderr carries only real failures.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::FPS;
use crate::{Error, Result};

/// Verify ffmpeg is on the PATH. Called once at pipeline load.
pub fn ensure_ffmpeg() -> Result<()> {
    which::which("ffmpeg")
        .map(|_| ())
        .map_err(|_| Error::Config("ffmpeg not found on PATH".into()))
}

/// Minimal ffmpeg command builder.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<(Vec<String>, PathBuf)>,
    output_args: Vec<String>,
    output: PathBuf,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output_args: Vec::new(),
            output: output.as_ref().to_path_buf(),
        }
    }

    /// Add an input with its preceding arguments.
    pub fn input<I, S>(mut self, args: I, path: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push((
            args.into_iter().map(Into::into).collect(),
            path.as_ref().to_path_buf(),
        ));
        self
    }

    /// Add output arguments (after all inputs).
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full argument list as passed to ffmpeg.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-v".to_string(), "error".to_string()];
        for (input_args, path) in &self.inputs {
            args.extend(input_args.iter().cloned());
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.display().to_string());
        args
    }

    /// Run ffmpeg to completion. Non-zero exit becomes [`Error::Assembly`]
    /// carrying stderr.
    pub async fn run(&self) -> Result<()> {
        let args = self.to_args();
        tracing::debug!(?args, "running ffmpeg");
        let output = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Assembly(format!("failed to spawn ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Assembly(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Combine a numbered PNG frame sequence and an audio file into one playable
/// video. `-shortest` keeps the streams aligned to the shorter of the two.
pub fn mux_command(frames_dir: &Path, audio: &Path, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(output)
        .input(
            vec!["-framerate".to_string(), format!("{FPS}")],
            frames_dir.join("%06d.png"),
        )
        .input(Vec::<String>::new(), audio)
        .output_args([
            "-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac", "-shortest",
        ])
}

/// Assemble the final video; the output file must exist and be non-empty
/// afterwards or the run fails with [`Error::Assembly`].
pub async fn assemble(frames_dir: &Path, audio: &Path, output: &Path) -> Result<()> {
    mux_command(frames_dir, audio, output).run().await?;
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(Error::Assembly(format!(
            "ffmpeg produced no output at {}",
            output.display()
        ))),
    }
}
