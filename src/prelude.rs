//! Prelude module for convenient imports
//!
//! ```rust,ignore
//! use scancam::prelude::*;
//! ```
//!
//! Items are grouped by the crate that owns them.

// =============================================================================
// Configuration & Errors
// =============================================================================

pub use scancam_core::{
    Camera, Result, RetryPolicy, RunMode, ScanCamConfig, ScanCamError, SequenceError,
    StageConfig, StageUnits, VideoFormatParams, Window,
};

// =============================================================================
// Stage Control
// =============================================================================

pub use scancam_driver_zaber::{
    DeviceOptions, MetaCommand, MoveCommand, Setting, StageSet, Transport, ZaberDevice,
};

// =============================================================================
// Scans
// =============================================================================

pub use scancam_experiment::{
    CommandCamera, CoordinateSolver, NativePosition, RepeatSchedule, Scan, ScanPoint,
    ScanSequencer, SequencerState,
};
