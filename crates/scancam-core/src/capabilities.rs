//! Capability traits for the rig's external collaborators.
//!
//! The stage protocol lives in the driver crates; the camera is only ever seen
//! through [`Camera`], so a scan can run against the real recorder, a mock, or
//! anything else that can produce a clip of a given length.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanCamError};

// =============================================================================
// Video Format
// =============================================================================

/// Sensor region in pixels, measured from each edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Pixels from the left edge
    pub left: u32,
    /// Pixels from the right edge
    pub right: u32,
    /// Pixels from the top edge
    pub top: u32,
    /// Pixels from the bottom edge
    pub bottom: u32,
}

impl Window {
    /// Create a window from its four edges.
    pub fn new(left: u32, right: u32, top: u32, bottom: u32) -> Self {
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    /// Comma-separated `left,right,top,bottom` form used on command lines.
    pub fn to_arg(&self) -> String {
        format!("{},{},{},{}", self.left, self.right, self.top, self.bottom)
    }
}

/// Optional camera video parameters attached to a scan.
///
/// `subsampling` and `binning` are mutually exclusive. When `exposure_window`
/// is absent the camera meters over the `cropping` region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VideoFormatParams {
    /// Keep every n-th pixel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsampling: Option<u32>,
    /// Sum n×n pixel blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binning: Option<u32>,
    /// Region of the sensor that is recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cropping: Option<Window>,
    /// Region used for exposure control
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_window: Option<Window>,
}

impl VideoFormatParams {
    /// Check the mutual-exclusion and range rules.
    pub fn validate(&self) -> Result<()> {
        if self.subsampling.is_some() && self.binning.is_some() {
            return Err(ScanCamError::InvalidFormatParams(
                "subsampling and binning are mutually exclusive".into(),
            ));
        }
        if self.subsampling == Some(0) || self.binning == Some(0) {
            return Err(ScanCamError::InvalidFormatParams(
                "subsampling and binning factors must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The exposure window, falling back to the cropping region.
    pub fn effective_exposure_window(&self) -> Option<Window> {
        self.exposure_window.or(self.cropping)
    }
}

// =============================================================================
// Camera Capability
// =============================================================================

/// Capability: record a video clip (or still image) to storage.
///
/// A `clip_duration_secs` of 0 requests a single still image. Implementations
/// own their retry behaviour; an error returned here is final and aborts the
/// scan.
///
/// # Contract
/// - `name_base` has no extension; the implementation chooses one.
/// - The call returns only once the clip is fully recorded.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Record a clip of `clip_duration_secs` seconds named after `name_base`.
    async fn record_video(
        &self,
        name_base: &str,
        clip_duration_secs: u32,
        format: Option<&VideoFormatParams>,
    ) -> Result<()>;
}
