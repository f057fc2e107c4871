//! `scancam-core`
//!
//! Core types shared by every scancam crate: the error taxonomy, retry
//! policies, rig limits, configuration, serial helpers and the camera
//! capability.
//!
//! ## Key Types
//!
//! - [`ScanCamError`]: error enum covering geometry, device, scan and camera failures
//! - [`SequenceError`]: a failure raised while a scan is executing
//! - [`ScanCamConfig`]: immutable configuration loaded through figment
//! - [`Camera`]: capability implemented by anything that can record a clip
//! - [`RetryPolicy`]: bounded exponential backoff

pub mod capabilities;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod limits;
pub mod serial;

pub use capabilities::{Camera, VideoFormatParams, Window};
pub use config::{
    AngleUnit, ControllerSeries, GeometryConfig, RunMode, ScanCamConfig, SequencerConfig,
    StageConfig, StageUnits,
};
pub use error::{Result, ScanCamError, SequenceError};
pub use error_recovery::{retry_with_backoff, RetryPolicy};
