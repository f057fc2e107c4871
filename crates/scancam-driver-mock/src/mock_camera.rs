//! Mock camera implementation.
//!
//! Records every capture request instead of running a recorder. In
//! realistic mode a capture takes as long as the requested clip.

use async_trait::async_trait;
use parking_lot::Mutex;
use scancam_core::{Camera, Result, ScanCamError, VideoFormatParams};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

use crate::common::MockMode;

/// One capture request seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    /// Filename base passed by the caller
    pub name_base: String,
    /// Clip length in whole seconds
    pub clip_duration_secs: u32,
    /// Format parameters, if any
    pub format: Option<VideoFormatParams>,
    /// When the request arrived
    pub requested_at: Instant,
}

type CaptureHook = dyn Fn(&Recording) + Send + Sync;

/// Camera that records requests.
#[derive(Clone, Default)]
pub struct MockCamera {
    mode: MockMode,
    recordings: Arc<Mutex<Vec<Recording>>>,
    failures_left: Arc<Mutex<u32>>,
    hook: Option<Arc<CaptureHook>>,
}

impl std::fmt::Debug for MockCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCamera")
            .field("mode", &self.mode)
            .field("recordings", &self.recordings.lock().len())
            .finish()
    }
}

impl MockCamera {
    /// Instant-mode camera that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timing mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fail the next `count` captures.
    pub fn failing(self, count: u32) -> Self {
        *self.failures_left.lock() = count;
        self
    }

    /// Run `hook` at the start of every capture.
    pub fn on_capture<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Recording) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Every request received, including failed ones.
    pub fn recordings(&self) -> Vec<Recording> {
        self.recordings.lock().clone()
    }

    /// Number of requests received.
    pub fn capture_count(&self) -> usize {
        self.recordings.lock().len()
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn record_video(
        &self,
        name_base: &str,
        clip_duration_secs: u32,
        format: Option<&VideoFormatParams>,
    ) -> Result<()> {
        let recording = Recording {
            name_base: name_base.to_string(),
            clip_duration_secs,
            format: format.cloned(),
            requested_at: Instant::now(),
        };
        tracing::debug!(name_base, clip_duration_secs, "mock capture");
        if let Some(hook) = &self.hook {
            hook(&recording);
        }
        self.recordings.lock().push(recording);

        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(ScanCamError::CameraCapture(format!(
                    "injected failure recording '{}'",
                    name_base
                )));
            }
        }

        if self.mode == MockMode::Realistic {
            sleep(Duration::from_secs(u64::from(clip_duration_secs))).await;
        }
        Ok(())
    }
}
