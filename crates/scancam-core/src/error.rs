//! Custom error types for scancam.
//!
//! This module defines the primary error type, `ScanCamError`, shared by every
//! crate in the workspace. Using the `thiserror` crate, it provides a
//! centralized way to report failures from the stage protocol, the coordinate
//! solver, the camera and the scan sequencer.
//!
//! ## Error Hierarchy
//!
//! - **Geometry**: `UnreachablePosition` when a Cartesian target cannot be
//!   expressed in the rig's native coordinates.
//! - **Device**: `DeviceTimeout`, `DeviceCommand`, `Initialization`,
//!   `UnknownAxis` and `Transport` cover everything that happens on the serial
//!   chain.
//! - **Scan data**: `InvalidScanPoint` and `InvalidFormatParams` are raised
//!   when scan records are built, never while a scan is running.
//! - **Runtime**: `CameraCapture`, `Cancelled` and `Configuration`.
//!
//! Failures raised while a scan is executing are wrapped in [`SequenceError`],
//! which records the point being processed.

use thiserror::Error;

/// Convenience alias for results using the scancam error type.
pub type Result<T> = std::result::Result<T, ScanCamError>;

/// Primary error type for scancam.
///
/// Device-level variants carry the device identifier so that a failure deep in
/// a multi-axis move can be traced back to the stage that caused it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanCamError {
    /// The solver could not place the camera over `(x, y)` within the X-axis limits.
    ///
    /// **Error Type**: Permanent for this point; the scan definition is wrong
    /// for the configured rig geometry.
    #[error("Position ({x:.3}, {y:.3}) is unreachable with the configured geometry")]
    UnreachablePosition {
        /// Requested Cartesian x (mm)
        x: f64,
        /// Requested Cartesian y (mm)
        y: f64,
    },

    /// A device did not finish its action before the deadline.
    ///
    /// **Error Type**: Transient or hardware fault. The caller is expected to
    /// stop all motion before propagating.
    #[error("Device '{0}' timed out waiting for its action to complete")]
    DeviceTimeout(String),

    /// The device answered with a non-busy error frame.
    ///
    /// `code` is the command category the sub-code refers to and `subcode` is
    /// the raw value carried in the error frame.
    #[error("Device '{device}' rejected command {code}: error {subcode} ({description})")]
    DeviceCommand {
        /// Device identifier
        device: String,
        /// Command code the error refers to
        code: u8,
        /// Sub-error code reported by the controller
        subcode: i32,
        /// Human-readable description of the sub-code
        description: String,
    },

    /// The settings handshake did not complete after the bounded retries.
    #[error("Device '{device}' failed to initialize: {reason}")]
    Initialization {
        /// Device identifier
        device: String,
        /// What went wrong
        reason: String,
    },

    /// A move or query named an axis that is not part of the stage set.
    #[error("Unknown axis '{0}'")]
    UnknownAxis(String),

    /// The serial link failed or was closed underneath a request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The camera collaborator gave up after its own retries.
    #[error("Camera capture failed: {0}")]
    CameraCapture(String),

    /// A scan point failed validation at construction time.
    #[error("Invalid scan point: {0}")]
    InvalidScanPoint(String),

    /// Video format parameters are inconsistent (e.g. binning with subsampling).
    #[error("Invalid video format parameters: {0}")]
    InvalidFormatParams(String),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation was aborted by the operator.
    #[error("Operation cancelled")]
    Cancelled,
}

impl ScanCamError {
    /// Returns true for errors that leave stages potentially in motion.
    ///
    /// The sequencer issues a group stop before propagating these.
    pub fn requires_stop(&self) -> bool {
        matches!(
            self,
            ScanCamError::DeviceTimeout(_)
                | ScanCamError::DeviceCommand { .. }
                | ScanCamError::Transport(_)
                | ScanCamError::Cancelled
        )
    }
}

impl From<std::io::Error> for ScanCamError {
    fn from(err: std::io::Error) -> Self {
        ScanCamError::Transport(err.to_string())
    }
}

impl From<figment::Error> for ScanCamError {
    fn from(err: figment::Error) -> Self {
        ScanCamError::Configuration(err.to_string())
    }
}

/// Failure raised while a scan is executing.
///
/// Wraps the underlying [`ScanCamError`] together with the scan and point that
/// were being processed. `point_index` is 1-based, matching the index used in
/// recorded filenames; it is `None` for failures during homing or stowing.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Scan '{scan_id}' aborted{}: {source}", describe_point(.point_index, .point_id))]
pub struct SequenceError {
    /// Identifier of the scan being executed
    pub scan_id: String,
    /// 1-based index of the failing point
    pub point_index: Option<usize>,
    /// User-defined point identifier, when present
    pub point_id: Option<String>,
    /// Underlying failure
    #[source]
    pub source: Box<ScanCamError>,
}

impl SequenceError {
    /// Wrap an error raised outside of any particular point.
    pub fn new(scan_id: impl Into<String>, source: ScanCamError) -> Self {
        Self {
            scan_id: scan_id.into(),
            point_index: None,
            point_id: None,
            source: Box::new(source),
        }
    }

    /// Attach the point being processed when the error occurred.
    pub fn at_point(mut self, index: usize, point_id: Option<&str>) -> Self {
        self.point_index = Some(index);
        self.point_id = point_id.map(str::to_string);
        self
    }

    /// The underlying error.
    pub fn kind(&self) -> &ScanCamError {
        &self.source
    }
}

fn describe_point(index: &Option<usize>, point_id: &Option<String>) -> String {
    match (index, point_id) {
        (Some(i), Some(id)) => format!(" at point {} ('{}')", i, id),
        (Some(i), None) => format!(" at point {}", i),
        _ => String::new(),
    }
}
