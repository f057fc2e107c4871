//! Camera backed by an external recorder program.
//!
//! Each clip runs the configured program once:
//!
//! ```text
//! <program> <extra_args...> --output <name> --duration <secs>
//!           [--subsampling n | --binning n] [--crop l,r,t,b] [--exposure-window l,r,t,b]
//! ```
//!
//! in the video directory. A non-zero exit is retried up to `max_tries`
//! invocations in total.

use async_trait::async_trait;
use scancam_core::config::CameraConfig;
use scancam_core::{retry_with_backoff, Camera, Result, RetryPolicy, ScanCamError, VideoFormatParams};
use std::path::PathBuf;
use tokio::process::Command;

/// [`Camera`] that shells out to a recorder.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    program: String,
    extra_args: Vec<String>,
    video_dir: PathBuf,
    retry: RetryPolicy,
}

impl CommandCamera {
    /// Camera using the recorder described by `config`.
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
            video_dir: config.video_dir.clone(),
            retry: RetryPolicy::immediate(config.max_tries.saturating_sub(1)),
        }
    }

    /// Full argument list for one clip.
    pub fn args(
        &self,
        name_base: &str,
        clip_duration_secs: u32,
        format: Option<&VideoFormatParams>,
    ) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "--output".to_string(),
            name_base.to_string(),
            "--duration".to_string(),
            clip_duration_secs.to_string(),
        ]);
        if let Some(format) = format {
            if let Some(n) = format.subsampling {
                args.extend(["--subsampling".to_string(), n.to_string()]);
            }
            if let Some(n) = format.binning {
                args.extend(["--binning".to_string(), n.to_string()]);
            }
            if let Some(crop) = format.cropping {
                args.extend(["--crop".to_string(), crop.to_arg()]);
            }
            if let Some(window) = format.effective_exposure_window() {
                args.extend(["--exposure-window".to_string(), window.to_arg()]);
            }
        }
        args
    }

    async fn invoke(&self, args: &[String], attempt: u32) -> Result<()> {
        tracing::debug!(program = %self.program, ?args, attempt, "Invoking recorder");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.video_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ScanCamError::CameraCapture(format!("cannot run '{}': {}", self.program, e))
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ScanCamError::CameraCapture(format!(
            "'{}' exited with {}: {}",
            self.program,
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl Camera for CommandCamera {
    async fn record_video(
        &self,
        name_base: &str,
        clip_duration_secs: u32,
        format: Option<&VideoFormatParams>,
    ) -> Result<()> {
        let args = self.args(name_base, clip_duration_secs, format);
        retry_with_backoff(&self.retry, |attempt| self.invoke(&args, attempt))
            .await
            .inspect_err(|e| tracing::error!(name_base, error = %e, "Recording failed"))
    }
}
