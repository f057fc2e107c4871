//! Conversion between physical units and controller microsteps.
//!
//! A stage is described by how many physical units one full motor step
//! covers. The controller reports its microstep resolution during the
//! settings handshake, which fixes microsteps per unit.

use scancam_core::config::{ControllerSeries, StageUnits};

/// Per-stage unit scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitScale {
    units: StageUnits,
    series: ControllerSeries,
}

impl UnitScale {
    /// Scaling for a stage with the given units and controller family.
    pub fn new(units: StageUnits, series: ControllerSeries) -> Self {
        Self { units, series }
    }

    /// Raw microsteps on a T-series controller.
    pub fn microsteps() -> Self {
        Self::new(StageUnits::Microsteps, ControllerSeries::TSeries)
    }

    /// Stage units.
    pub fn units(&self) -> StageUnits {
        self.units
    }

    /// Microsteps per physical unit for a given microstep resolution.
    ///
    /// Stages driven in raw microsteps always have a factor of 1.
    pub fn microsteps_per_unit(&self, microstep_resolution: i32) -> f64 {
        match self.units.units_per_step() {
            Some(per_step) => f64::from(microstep_resolution) / per_step,
            None => 1.0,
        }
    }

    /// Speed data value for `units_per_sec`.
    ///
    /// T-series controllers move at `data × 9.375` microsteps/s and A-series
    /// controllers at `data / 1.6384` microsteps/s. The result is at least 1,
    /// since a target speed of 0 is rejected by the firmware.
    pub fn speed_data(&self, units_per_sec: f64, microsteps_per_unit: f64) -> i32 {
        let microsteps_per_sec = units_per_sec * microsteps_per_unit;
        let data = match self.series {
            ControllerSeries::TSeries => microsteps_per_sec / 9.375,
            ControllerSeries::ASeries => microsteps_per_sec * 1.6384,
        };
        to_data(data.round()).max(1)
    }
}

/// Convert a physical position or distance into microsteps, truncating toward zero.
pub fn to_microsteps(value: f64, microsteps_per_unit: f64) -> i32 {
    to_data((value * microsteps_per_unit).trunc())
}

/// Convert microsteps back into physical units.
pub fn from_microsteps(microsteps: i32, microsteps_per_unit: f64) -> f64 {
    if microsteps_per_unit == 0.0 {
        return 0.0;
    }
    f64::from(microsteps) / microsteps_per_unit
}

fn to_data(value: f64) -> i32 {
    // Saturating float-to-int cast; NaN becomes 0
    value as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use scancam_core::config::{AngleUnit, DEFAULT_DEG_PER_STEP};

    #[test]
    fn test_rotary_degrees() {
        let scale = UnitScale::new(
            StageUnits::Rotary {
                deg_per_step: DEFAULT_DEG_PER_STEP,
                unit: AngleUnit::Deg,
            },
            ControllerSeries::TSeries,
        );
        let mpu = scale.microsteps_per_unit(64);
        // 0.015 deg per step at 64 microsteps/step
        assert!((mpu - 64.0 / 0.015).abs() < 1e-9);
        assert_eq!(to_microsteps(90.0, mpu), 384_000);
    }

    #[test]
    fn test_raw_microsteps() {
        let scale = UnitScale::microsteps();
        assert_eq!(scale.microsteps_per_unit(128), 1.0);
        assert_eq!(to_microsteps(1234.9, 1.0), 1234);
        assert_eq!(to_microsteps(-1234.9, 1.0), -1234);
    }

    #[test]
    fn test_linear_round_trip() {
        let scale = UnitScale::new(
            StageUnits::Linear { mm_per_step: 0.01 },
            ControllerSeries::TSeries,
        );
        let mpu = scale.microsteps_per_unit(64);
        assert_eq!(to_microsteps(2.5, mpu), 16_000);
        assert!((from_microsteps(16_000, mpu) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_speed_data_series() {
        let linear = StageUnits::Linear { mm_per_step: 0.01 };
        let mpu = 6400.0; // 64 microsteps per 0.01 mm

        let t = UnitScale::new(linear, ControllerSeries::TSeries);
        // 1 mm/s = 6400 microsteps/s = 6400 / 9.375
        assert_eq!(t.speed_data(1.0, mpu), 683);

        let a = UnitScale::new(linear, ControllerSeries::ASeries);
        assert_eq!(a.speed_data(1.0, mpu), 10_486);

        assert_eq!(t.speed_data(0.0, mpu), 1);
    }

    #[test]
    fn test_out_of_range_saturates() {
        assert_eq!(to_microsteps(1e12, 1.0), i32::MAX);
        assert_eq!(to_microsteps(f64::NAN, 1.0), 0);
    }
}
