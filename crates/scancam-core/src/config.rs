//! Configuration System using Figment
//!
//! Strongly-typed configuration for the rig. Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables prefixed with `SCANCAM_`, nested keys separated by
//!    a double underscore (`SCANCAM_SEQUENCER__STAGE_TIMEOUT_SECS=30`)
//!
//! Every section has defaults describing the standard X/theta/z rig, so an
//! empty file is a valid configuration. The loaded [`ScanCamConfig`] is
//! immutable and handed to each component at construction.
//!
//! # Example
//! ```no_run
//! use scancam_core::config::ScanCamConfig;
//!
//! let config = ScanCamConfig::load_from("config/scancam.toml")?;
//! config.validate()?;
//! println!("Serial port: {}", config.serial.port);
//! # Ok::<(), scancam_core::error::ScanCamError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Result, ScanCamError};
use crate::error_recovery::RetryPolicy;
use crate::limits::{
    BLOCKING_RETRIES, DEFAULT_RESPONSE_TIMEOUT_SECS, DEFAULT_STAGE_TIMEOUT_SECS,
    MAX_CAMERA_TRIES, MAX_CLIP_LENGTH, MAX_Z_MOVE_SPEED, STANDARD_Z_SPEED,
};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/scancam.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanCamConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Device protocol tuning
    pub protocol: ProtocolConfig,
    /// One entry per stage on the chain
    pub stages: Vec<StageConfig>,
    /// Rig geometry used by the coordinate solver
    pub geometry: GeometryConfig,
    /// Scan sequencing parameters
    pub sequencer: SequencerConfig,
    /// External camera recorder
    pub camera: CameraConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scancam".into(),
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path
    pub port: String,
    /// Baud rate (controllers use 9600 8N1)
    pub baud_rate: u32,
    /// Milliseconds spent discarding stale bytes after opening
    pub drain_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            drain_ms: 50,
        }
    }
}

/// Device protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Attempts for a blocking settings query
    pub blocking_retries: u32,
    /// Deadline for a blocking request's reply, in whole seconds
    pub response_timeout_secs: u64,
    /// Resend policy after a busy reply
    pub busy_retry: RetryPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            blocking_retries: BLOCKING_RETRIES,
            response_timeout_secs: DEFAULT_RESPONSE_TIMEOUT_SECS,
            busy_retry: RetryPolicy::default(),
        }
    }
}

/// Whether queued commands run back to back or one per `step()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Dispatch the next queued command as soon as the previous one completes
    Continuous,
    /// Dispatch one queued command per `step()` call
    #[default]
    Stepped,
}

/// Controller family, which fixes the speed-data scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerSeries {
    /// T-series: microsteps/s = data × 9.375
    #[default]
    TSeries,
    /// A-series: microsteps/s = data / 1.6384
    ASeries,
}

/// Unit of a rotary stage's positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AngleUnit {
    /// Degrees
    #[default]
    Deg,
    /// Radians
    Rad,
}

/// Physical unit a stage is driven in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StageUnits {
    /// Raw controller microsteps
    Microsteps,
    /// Linear stage; millimetres per full motor step
    Linear {
        /// Millimetres travelled per full step
        mm_per_step: f64,
    },
    /// Rotary stage; degrees per full motor step
    Rotary {
        /// Degrees rotated per full step
        #[serde(default = "default_deg_per_step")]
        deg_per_step: f64,
        /// Unit used for positions
        #[serde(default)]
        unit: AngleUnit,
    },
}

/// Degrees per full step of the standard rotary stage.
pub const DEFAULT_DEG_PER_STEP: f64 = 0.000_234_375 * 64.0;

fn default_deg_per_step() -> f64 {
    DEFAULT_DEG_PER_STEP
}

impl StageUnits {
    /// Physical units per full step, or `None` when driven in raw microsteps.
    pub fn units_per_step(&self) -> Option<f64> {
        match *self {
            StageUnits::Microsteps => None,
            StageUnits::Linear { mm_per_step } => Some(mm_per_step),
            StageUnits::Rotary { deg_per_step, unit } => Some(match unit {
                AngleUnit::Deg => deg_per_step,
                AngleUnit::Rad => deg_per_step.to_radians(),
            }),
        }
    }

    /// Short unit label for log output.
    pub fn label(&self) -> &'static str {
        match self {
            StageUnits::Microsteps => "microsteps",
            StageUnits::Linear { .. } => "mm",
            StageUnits::Rotary {
                unit: AngleUnit::Deg,
                ..
            } => "deg",
            StageUnits::Rotary {
                unit: AngleUnit::Rad,
                ..
            } => "rad",
        }
    }
}

/// One stage on the serial chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Axis identifier (`X`, `theta`, `z`)
    pub axis: String,
    /// Device number on the chain (1..=254)
    pub address: u8,
    /// Physical units
    pub units: StageUnits,
    /// Controller family
    #[serde(default)]
    pub controller: ControllerSeries,
    /// Queue dispatch mode
    #[serde(default)]
    pub run_mode: RunMode,
}

impl StageConfig {
    /// The standard X/theta/z stage chain.
    pub fn default_rig() -> Vec<StageConfig> {
        vec![
            StageConfig {
                axis: "X".into(),
                address: 1,
                units: StageUnits::Linear {
                    mm_per_step: 0.003_048,
                },
                controller: ControllerSeries::TSeries,
                run_mode: RunMode::Stepped,
            },
            StageConfig {
                axis: "theta".into(),
                address: 2,
                units: StageUnits::Rotary {
                    deg_per_step: DEFAULT_DEG_PER_STEP,
                    unit: AngleUnit::Deg,
                },
                controller: ControllerSeries::TSeries,
                run_mode: RunMode::Stepped,
            },
            StageConfig {
                axis: "z".into(),
                address: 3,
                units: StageUnits::Linear {
                    mm_per_step: 0.003_048,
                },
                controller: ControllerSeries::TSeries,
                run_mode: RunMode::Stepped,
            },
        ]
    }
}

/// Swing-arm geometry of the rig
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Distance from the rotary axis to the camera's optical axis (mm)
    pub arm_length: f64,
    /// Lowest acceptable X-stage position (mm)
    pub min_x: f64,
    /// Highest acceptable X-stage position (mm)
    pub max_x: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            arm_length: 52.5,
            min_x: 0.0,
            max_x: 176.0,
        }
    }
}

/// Cartesian stow target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StowPosition {
    /// x (mm)
    pub x: f64,
    /// y (mm)
    pub y: f64,
    /// depth (mm)
    pub z: f64,
}

impl Default for StowPosition {
    fn default() -> Self {
        Self {
            x: 120.0,
            y: 0.0,
            z: 5.0,
        }
    }
}

/// Scan sequencing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Seconds between triggering the camera and its first frame
    pub camera_warmup: f64,
    /// Budget for a stage group to finish a move, in whole seconds
    pub stage_timeout_secs: u64,
    /// Fastest depth sweep (mm/s)
    pub max_z_speed: f64,
    /// Depth speed for ordinary positioning moves (mm/s)
    pub standard_z_speed: f64,
    /// Longest clip a scan point may request (seconds)
    pub max_clip_length: f64,
    /// Home every stage before the first point
    pub home_before_scan: bool,
    /// Return to the stow position after the last point
    pub stow_after_scan: bool,
    /// Stow target
    pub stow: StowPosition,
    /// Host identifier used in filenames; defaults to the machine hostname
    pub host_id: Option<String>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            camera_warmup: 0.0,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            max_z_speed: MAX_Z_MOVE_SPEED,
            standard_z_speed: STANDARD_Z_SPEED,
            max_clip_length: MAX_CLIP_LENGTH,
            home_before_scan: true,
            stow_after_scan: false,
            stow: StowPosition::default(),
            host_id: None,
        }
    }
}

/// External camera recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Recorder program invoked once per clip
    pub program: String,
    /// Arguments placed before the generated ones
    pub extra_args: Vec<String>,
    /// Directory clips are written to
    pub video_dir: PathBuf,
    /// Total invocations per clip before giving up
    pub max_tries: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            program: "idscam".into(),
            extra_args: vec!["video".into()],
            video_dir: PathBuf::from("."),
            max_tries: MAX_CAMERA_TRIES,
        }
    }
}

impl ScanCamConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment apply.
    /// An empty `stages` list is replaced by the standard rig.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config: ScanCamConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCANCAM_").split("__"))
            .extract()?;
        if config.stages.is_empty() {
            config.stages = StageConfig::default_rig();
        }
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let mut config: ScanCamConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()?;
        if config.stages.is_empty() {
            config.stages = StageConfig::default_rig();
        }
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut axes = HashSet::new();
        let mut addresses = HashSet::new();
        for stage in &self.stages {
            if !axes.insert(stage.axis.as_str()) {
                return Err(invalid(format!("Duplicate stage axis: {}", stage.axis)));
            }
            if !addresses.insert(stage.address) {
                return Err(invalid(format!(
                    "Duplicate stage address: {}",
                    stage.address
                )));
            }
            if stage.address == 0 || stage.address == 255 {
                return Err(invalid(format!(
                    "Stage '{}' address {} is reserved. Must be 1-254",
                    stage.axis, stage.address
                )));
            }
            if let Some(per_step) = stage.units.units_per_step() {
                if !(per_step.is_finite() && per_step > 0.0) {
                    return Err(invalid(format!(
                        "Stage '{}' step size must be positive",
                        stage.axis
                    )));
                }
            }
        }

        let g = &self.geometry;
        if !(g.arm_length > 0.0) {
            return Err(invalid("geometry.arm_length must be positive"));
        }
        if !(g.min_x < g.max_x) {
            return Err(invalid(format!(
                "geometry.min_x ({}) must be below max_x ({})",
                g.min_x, g.max_x
            )));
        }

        let s = &self.sequencer;
        if !(s.max_z_speed > 0.0 && s.standard_z_speed > 0.0) {
            return Err(invalid("sequencer z speeds must be positive"));
        }
        if s.camera_warmup < 0.0 {
            return Err(invalid("sequencer.camera_warmup must not be negative"));
        }
        if s.stage_timeout_secs == 0 {
            return Err(invalid("sequencer.stage_timeout_secs must be at least 1"));
        }

        if self.camera.max_tries == 0 {
            return Err(invalid("camera.max_tries must be at least 1"));
        }
        if self.protocol.blocking_retries == 0 {
            return Err(invalid("protocol.blocking_retries must be at least 1"));
        }

        Ok(())
    }

    /// Find the stage configured for `axis`.
    pub fn stage(&self, axis: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.axis == axis)
    }
}

fn invalid(message: impl Into<String>) -> ScanCamError {
    ScanCamError::Configuration(message.into())
}
