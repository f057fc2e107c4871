//! Scan execution for scancam.
//!
//! - [`scan`]: validated scan points and scans, parsed from JSON
//! - [`solver`]: Cartesian to `(X, theta)` conversion with branch hysteresis
//! - [`sequencer`]: drives the stages and camera through a scan
//! - [`camera`]: [`Camera`](scancam_core::Camera) backed by a recorder program
//!
//! # Example
//!
//! ```rust,ignore
//! let stages = StageSet::connect(&config, transport).await?;
//! let camera = Arc::new(CommandCamera::new(&config.camera));
//! let mut sequencer = ScanSequencer::new(stages, camera, config);
//! sequencer.run(&Scan::from_json_file("plate.json")?).await?;
//! ```

pub mod camera;
pub mod scan;
pub mod sequencer;
pub mod solver;

pub use camera::CommandCamera;
pub use scan::{Scan, ScanPoint, ScanPointBuilder};
pub use sequencer::{
    filename_base, plan_scan, AbortHandle, CapturePlan, DepthSweep, PlannedPoint, RepeatSchedule,
    ScanSequencer, SequencerState, THETA_AXIS, X_AXIS, Z_AXIS,
};
pub use solver::{CoordinateSolver, NativePosition};
