//! Scan definitions.
//!
//! A [`Scan`] is an ordered list of [`ScanPoint`]s plus optional camera
//! format parameters. Points are validated when they are built, so the
//! sequencer never has to second-guess a field.
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "id": "plate-7",
//!   "video-format-params": { "binning": 2, "cropping": { "left": 0, "right": 0, "top": 8, "bottom": 8 } },
//!   "points": [
//!     { "x": 60.0, "y": 10.0 },
//!     { "x": 62.0, "y": 10.0, "z0": 4.0, "z1": 6.0, "t": 5, "point-id": "A1", "area-id": "well-1" }
//!   ]
//! }
//! ```

use scancam_core::limits::MAX_CLIP_LENGTH;
use scancam_core::{Result, ScanCamError, VideoFormatParams};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// ScanPoint
// =============================================================================

/// One waypoint of a scan.
///
/// - `t` absent: transit only, no capture and no depth move
/// - `t == 0`: still image
/// - `t > 0`: clip of `floor(t)` seconds, sweeping `z0 → z1` when `z1` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScanPoint", into = "RawScanPoint")]
pub struct ScanPoint {
    x: f64,
    y: f64,
    z0: Option<f64>,
    z1: Option<f64>,
    t: Option<f64>,
    point_id: Option<String>,
    area_id: Option<String>,
}

/// Wire shape of a point before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawScanPoint {
    x: f64,
    y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    point_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    area_id: Option<String>,
}

impl TryFrom<RawScanPoint> for ScanPoint {
    type Error = ScanCamError;

    fn try_from(raw: RawScanPoint) -> Result<Self> {
        let point = ScanPoint {
            x: raw.x,
            y: raw.y,
            z0: raw.z0,
            z1: raw.z1,
            t: raw.t,
            point_id: raw.point_id,
            area_id: raw.area_id,
        };
        point.validate()?;
        Ok(point)
    }
}

impl From<ScanPoint> for RawScanPoint {
    fn from(point: ScanPoint) -> Self {
        RawScanPoint {
            x: point.x,
            y: point.y,
            z0: point.z0,
            z1: point.z1,
            t: point.t,
            point_id: point.point_id,
            area_id: point.area_id,
        }
    }
}

impl ScanPoint {
    /// Start building a point at `(x, y)`.
    pub fn builder(x: f64, y: f64) -> ScanPointBuilder {
        ScanPointBuilder {
            raw: RawScanPoint {
                x,
                y,
                ..RawScanPoint::default()
            },
        }
    }

    /// Transit-only point at `(x, y)`.
    pub fn at(x: f64, y: f64) -> Result<Self> {
        Self::builder(x, y).build()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ScanCamError::InvalidScanPoint(msg));
        if !(self.x.is_finite() && self.y.is_finite()) {
            return invalid(format!("coordinates ({}, {}) must be finite", self.x, self.y));
        }
        for (name, value) in [("z0", self.z0), ("z1", self.z1)] {
            if value.is_some_and(|v| !v.is_finite()) {
                return invalid(format!("{} must be finite", name));
            }
        }
        if self.z1.is_some() && self.z0.is_none() {
            return invalid("z1 requires z0".into());
        }
        if let Some(t) = self.t {
            if !t.is_finite() || t < 0.0 {
                return invalid(format!("t = {} must be a non-negative number of seconds", t));
            }
            if t > MAX_CLIP_LENGTH {
                return invalid(format!(
                    "t = {} exceeds the {} s clip limit",
                    t, MAX_CLIP_LENGTH
                ));
            }
        }
        Ok(())
    }

    /// Cartesian x (mm).
    pub fn x(&self) -> f64 {
        self.x
    }

    /// Cartesian y (mm).
    pub fn y(&self) -> f64 {
        self.y
    }

    /// Depth at the start of the point (mm).
    pub fn z0(&self) -> Option<f64> {
        self.z0
    }

    /// Depth at the end of a sweep (mm).
    pub fn z1(&self) -> Option<f64> {
        self.z1
    }

    /// Capture time (s).
    pub fn t(&self) -> Option<f64> {
        self.t
    }

    /// Point identifier used in filenames.
    pub fn point_id(&self) -> Option<&str> {
        self.point_id.as_deref()
    }

    /// Plate area the point belongs to.
    pub fn area_id(&self) -> Option<&str> {
        self.area_id.as_deref()
    }

    /// Whether the point records anything.
    pub fn captures(&self) -> bool {
        self.t.is_some()
    }

    /// Whether the point sweeps depth during a clip.
    pub fn sweeps_depth(&self) -> bool {
        self.z1.is_some() && self.t.is_some_and(|t| t > 0.0)
    }
}

/// Builder for [`ScanPoint`].
#[derive(Debug, Clone)]
pub struct ScanPointBuilder {
    raw: RawScanPoint,
}

impl ScanPointBuilder {
    /// Depth to move to with the xy move.
    pub fn z0(mut self, z0: f64) -> Self {
        self.raw.z0 = Some(z0);
        self
    }

    /// Depth to sweep to during the clip.
    pub fn z1(mut self, z1: f64) -> Self {
        self.raw.z1 = Some(z1);
        self
    }

    /// Capture time in seconds.
    pub fn t(mut self, t: f64) -> Self {
        self.raw.t = Some(t);
        self
    }

    /// Point identifier.
    pub fn point_id(mut self, id: impl Into<String>) -> Self {
        self.raw.point_id = Some(id.into());
        self
    }

    /// Area identifier.
    pub fn area_id(mut self, id: impl Into<String>) -> Self {
        self.raw.area_id = Some(id.into());
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ScanPoint> {
        ScanPoint::try_from(self.raw)
    }
}

// =============================================================================
// Scan
// =============================================================================

/// An ordered scan, read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawScan", into = "RawScan")]
pub struct Scan {
    id: String,
    points: Vec<ScanPoint>,
    video_format_params: Option<VideoFormatParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawScan {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    video_format_params: Option<VideoFormatParams>,
    points: Vec<ScanPoint>,
}

impl TryFrom<RawScan> for Scan {
    type Error = ScanCamError;

    fn try_from(raw: RawScan) -> Result<Self> {
        Scan::new(raw.id, raw.points, raw.video_format_params)
    }
}

impl From<Scan> for RawScan {
    fn from(scan: Scan) -> Self {
        RawScan {
            id: scan.id,
            video_format_params: scan.video_format_params,
            points: scan.points,
        }
    }
}

impl Scan {
    /// Build a scan, validating its format parameters.
    pub fn new(
        id: impl Into<String>,
        points: Vec<ScanPoint>,
        video_format_params: Option<VideoFormatParams>,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ScanCamError::InvalidScanPoint("scan id must not be empty".into()));
        }
        if let Some(params) = &video_format_params {
            params.validate()?;
        }
        Ok(Self {
            id,
            points,
            video_format_params,
        })
    }

    /// Parse a scan from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ScanCamError::InvalidScanPoint(e.to_string()))
    }

    /// Read a scan from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ScanCamError::Configuration(format!("cannot read scan {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ScanCamError::InvalidScanPoint(e.to_string()))
    }

    /// Scan identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Points in scan order.
    pub fn points(&self) -> &[ScanPoint] {
        &self.points
    }

    /// Camera format parameters.
    pub fn video_format_params(&self) -> Option<&VideoFormatParams> {
        self.video_format_params.as_ref()
    }

    /// Number of points that record something.
    pub fn capture_count(&self) -> usize {
        self.points.iter().filter(|p| p.captures()).count()
    }
}
