//! # scancam
//!
//! Integration crate for the scanning plate imager: an X linear stage, a
//! rotary arm and a depth stage on one serial chain, plus a camera that
//! records a clip at each scan point.
//!
//! ## Recommended Usage
//!
//! ```rust,ignore
//! use scancam::prelude::*;
//! ```
//!
//! ## Crate Structure
//!
//! - **`core`**: Re-exported from `scancam-core`. Configuration, the error
//!   types, the `Camera` capability and retry helpers.
//! - **`zaber`**: Re-exported from `scancam-driver-zaber`. The 6-byte binary
//!   protocol, per-device command queues and the `StageSet` group controller.
//! - **`mock`**: Re-exported from `scancam-driver-mock`. An emulated
//!   controller chain and a recording camera for tests and `--mock` runs.
//! - **`experiment`**: Re-exported from `scancam-experiment`. Scan files, the
//!   coordinate solver and the scan sequencer.
//!
//! The `scancam` binary lives in `crates/scancam-bin`.

pub mod prelude;

pub use scancam_core as core;
pub use scancam_driver_mock as mock;
pub use scancam_driver_zaber as zaber;
pub use scancam_experiment as experiment;
