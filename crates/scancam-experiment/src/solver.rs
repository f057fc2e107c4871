//! Cartesian to rig coordinate conversion.
//!
//! The rig carries the camera on a swing arm of length `arm_length` mounted
//! on a linear `X` stage. A camera position `(x, y)` is reached with
//!
//! ```text
//! theta = acos(-y / arm_length)
//! X     = x + arm_length · sin(theta)
//! ```
//!
//! Every reachable `y` has two arm angles, `theta` and `360 - theta`. The
//! solver keeps using the branch it used last so consecutive points do not
//! swing the arm around, and switches only when `X` would leave its travel.

use scancam_core::{GeometryConfig, Result, ScanCamError};

/// Target in rig coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativePosition {
    /// Linear stage position (mm)
    pub x_stage: f64,
    /// Rotary stage angle (degrees)
    pub theta: f64,
}

/// Converts Cartesian targets into `(X, theta)` with branch hysteresis.
///
/// The branch flag is per instance; each sequencer owns its own solver.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateSolver {
    arm_length: f64,
    min_x: f64,
    max_x: f64,
    supplementary: bool,
}

impl CoordinateSolver {
    /// Solver for the configured geometry, starting on the primary branch.
    pub fn new(geometry: &GeometryConfig) -> Self {
        Self {
            arm_length: geometry.arm_length,
            min_x: geometry.min_x,
            max_x: geometry.max_x,
            supplementary: false,
        }
    }

    /// Whether the last solution used `360 - theta`.
    pub fn uses_supplementary_branch(&self) -> bool {
        self.supplementary
    }

    /// Forget the branch used last.
    pub fn reset(&mut self) {
        self.supplementary = false;
    }

    /// Solve `(x, y)` into rig coordinates.
    ///
    /// A `y` beyond the arm's reach points the arm straight towards it
    /// (`theta` 180 for positive `y`, 0 otherwise) instead of failing.
    pub fn to_native(&mut self, x: f64, y: f64) -> Result<NativePosition> {
        let ratio = -y / self.arm_length;
        let mut theta = if ratio.abs() <= 1.0 {
            let primary = ratio.acos().to_degrees();
            if self.supplementary {
                360.0 - primary
            } else {
                primary
            }
        } else {
            let theta = if y > 0.0 { 180.0 } else { 0.0 };
            tracing::debug!(x, y, theta, "Target beyond arm reach");
            theta
        };

        let mut x_stage = self.stage_x(x, theta);
        if !self.in_travel(x_stage) {
            self.supplementary = !self.supplementary;
            theta = 360.0 - theta;
            x_stage = self.stage_x(x, theta);
        }

        if !self.in_travel(x_stage) {
            tracing::error!(x, y, x_stage, "Target unreachable with configured geometry");
            return Err(ScanCamError::UnreachablePosition { x, y });
        }

        tracing::trace!(x, y, x_stage, theta, "Solved target");
        Ok(NativePosition { x_stage, theta })
    }

    /// Camera position for rig coordinates.
    pub fn to_cartesian(&self, x_stage: f64, theta: f64) -> (f64, f64) {
        let rad = theta.to_radians();
        (
            x_stage - rad.sin() * self.arm_length,
            -rad.cos() * self.arm_length,
        )
    }

    fn stage_x(&self, x: f64, theta: f64) -> f64 {
        x + self.arm_length * theta.to_radians().sin()
    }

    fn in_travel(&self, x_stage: f64) -> bool {
        x_stage >= self.min_x && x_stage <= self.max_x
    }
}
