//! ScanSequencer - executes a [`Scan`] on the rig.
//!
//! # State Machine
//!
//! ```text
//! NotStarted ──▶ [Homing] ──▶ Running(i) ──▶ Moving(i) ──▶ Capturing(i) ──▶ [FinishingDepthMove(i)]
//!                                 ▲                                                  │
//!                                 └──────────────────── next point ◀─────────────────┘
//!
//! any state ──▶ Aborted(error)        last point ──▶ [Stowing] ──▶ Completed
//! ```
//!
//! # Per-point Execution
//!
//! 1. Solve `(x, y)` into `(X, theta)` and move the group, including `z0`
//!    when present, then wait under the stage deadline.
//! 2. A point without `t` is a transit waypoint and ends here.
//! 3. With `z1` and `t > 0` the depth sweep is started without waiting,
//!    at a speed that spreads `|z1 - z0|` over the clip. A sweep faster
//!    than `max_z_speed` is clamped and the clip is lengthened instead.
//! 4. The camera records while the sweep runs on a spawned task; both are
//!    joined before the next point.
//!
//! Any error that can leave a stage moving stops every stage before the
//! run returns.

use chrono::{DateTime, Utc};
use scancam_core::{Camera, Result, ScanCamConfig, ScanCamError, SequenceError, SequencerConfig};
use scancam_driver_zaber::StageSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::scan::{Scan, ScanPoint};
use crate::solver::{CoordinateSolver, NativePosition};

/// Linear stage axis id.
pub const X_AXIS: &str = "X";
/// Rotary stage axis id.
pub const THETA_AXIS: &str = "theta";
/// Depth stage axis id.
pub const Z_AXIS: &str = "z";

/// Timestamp format used in clip names.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

// =============================================================================
// State
// =============================================================================

/// Sequencer state, published on a watch channel.
///
/// Point indices are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencerState {
    /// No scan has run yet
    NotStarted,
    /// Homing every stage before the first point
    Homing,
    /// Solving the next point
    Running {
        /// Point index
        point: usize,
    },
    /// Waiting for the positioning move
    Moving {
        /// Point index
        point: usize,
    },
    /// Camera is recording
    Capturing {
        /// Point index
        point: usize,
    },
    /// Waiting for the depth sweep after the clip
    FinishingDepthMove {
        /// Point index
        point: usize,
    },
    /// Returning to the stow position
    Stowing,
    /// Every point finished
    Completed,
    /// The run ended with an error
    Aborted(ScanCamError),
}

impl SequencerState {
    /// Whether the sequencer is between runs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequencerState::NotStarted | SequencerState::Completed | SequencerState::Aborted(_)
        )
    }
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerState::NotStarted => write!(f, "not started"),
            SequencerState::Homing => write!(f, "homing"),
            SequencerState::Running { point } => write!(f, "running point {}", point),
            SequencerState::Moving { point } => write!(f, "moving to point {}", point),
            SequencerState::Capturing { point } => write!(f, "capturing point {}", point),
            SequencerState::FinishingDepthMove { point } => {
                write!(f, "finishing depth move at point {}", point)
            }
            SequencerState::Stowing => write!(f, "stowing"),
            SequencerState::Completed => write!(f, "completed"),
            SequencerState::Aborted(e) => write!(f, "aborted: {}", e),
        }
    }
}

/// Operator abort for a running sequencer.
///
/// Cloneable; aborting from any clone cancels the current run and every
/// later one until [`AbortHandle::reset`] is called.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Request an abort.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clear a previous abort request.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }
}

/// How a set of scans is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatSchedule {
    /// Passes over the set; `None` repeats until aborted
    pub rounds: Option<u32>,
    /// Shortest time from the start of one pass to the start of the next
    pub min_period: Duration,
}

impl RepeatSchedule {
    /// A single pass.
    pub fn once() -> Self {
        Self {
            rounds: Some(1),
            min_period: Duration::ZERO,
        }
    }

    /// Passes until aborted, started at most once per `min_period`.
    pub fn forever(min_period: Duration) -> Self {
        Self {
            rounds: None,
            min_period,
        }
    }
}

// =============================================================================
// Planning
// =============================================================================

/// What the camera does at a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturePlan {
    /// Clip length passed to the camera; 0 is a still image
    pub clip_secs: u32,
    /// Depth sweep target and speed (mm, mm/s)
    pub sweep: Option<DepthSweep>,
}

/// A depth move run during a clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSweep {
    /// Depth to sweep to (mm)
    pub target: f64,
    /// Sweep speed (mm/s)
    pub speed: f64,
}

impl CapturePlan {
    /// Capture plan for `point`, or `None` for a transit point.
    pub fn for_point(point: &ScanPoint, config: &SequencerConfig) -> Option<Self> {
        let t = point.t()?;
        let mut clip = t.floor();
        let sweep = match (point.z0(), point.z1()) {
            (Some(z0), Some(z1)) if t > 0.0 => {
                let distance = (z1 - z0).abs();
                let mut speed = distance / (t + config.camera_warmup);
                if speed > config.max_z_speed {
                    speed = config.max_z_speed;
                    clip = (distance / config.max_z_speed - config.camera_warmup).ceil();
                }
                Some(DepthSweep { target: z1, speed })
            }
            _ => None,
        };
        Some(Self {
            clip_secs: clip.max(0.0) as u32,
            sweep,
        })
    }
}

/// A point as it will be executed.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPoint {
    /// 1-based index
    pub index: usize,
    /// Rig coordinates of the point
    pub native: NativePosition,
    /// Capture, if the point records
    pub capture: Option<CapturePlan>,
}

/// Check a scan against the configuration and solve every point.
///
/// Runs the same solver sequence as the real run, so branch hysteresis
/// matches. Nothing is sent to the rig.
pub fn plan_scan(scan: &Scan, config: &ScanCamConfig) -> std::result::Result<Vec<PlannedPoint>, SequenceError> {
    let mut solver = CoordinateSolver::new(&config.geometry);
    let limit = config.sequencer.max_clip_length;
    scan.points()
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let index = i + 1;
            let at_point = |e| SequenceError::new(scan.id(), e).at_point(index, point.point_id());
            if let Some(t) = point.t() {
                if t > limit {
                    return Err(at_point(ScanCamError::InvalidScanPoint(format!(
                        "t = {} exceeds the configured {} s clip limit",
                        t, limit
                    ))));
                }
            }
            let native = solver.to_native(point.x(), point.y()).map_err(at_point)?;
            Ok(PlannedPoint {
                index,
                native,
                capture: CapturePlan::for_point(point, &config.sequencer),
            })
        })
        .collect()
}

/// Clip name base: `{host}_{scan}_{point}.{timestamp}`.
///
/// `point` is the point id, or the 1-based index when the point has none.
pub fn filename_base(
    host: &str,
    scan_id: &str,
    index: usize,
    point_id: Option<&str>,
    at: DateTime<Utc>,
) -> String {
    let point = match point_id {
        Some(id) => id.to_string(),
        None => index.to_string(),
    };
    format!("{}_{}_{}.{}", host, scan_id, point, at.format(TIMESTAMP_FORMAT))
}

/// Configured host id, or the machine hostname.
fn resolve_host_id(config: &SequencerConfig) -> String {
    if let Some(id) = &config.host_id {
        return id.clone();
    }
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "Cannot read hostname, using 'scancam'");
            "scancam".into()
        }
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Runs scans on one rig.
///
/// Owns its coordinate solver; two sequencers never share branch state.
pub struct ScanSequencer {
    stages: StageSet,
    camera: Arc<dyn Camera>,
    config: ScanCamConfig,
    solver: CoordinateSolver,
    host_id: String,
    state_tx: watch::Sender<SequencerState>,
    abort_tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for ScanSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSequencer")
            .field("stages", &self.stages)
            .field("host_id", &self.host_id)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl ScanSequencer {
    /// Sequencer driving `stages` and `camera` with `config`.
    pub fn new(stages: StageSet, camera: Arc<dyn Camera>, config: ScanCamConfig) -> Self {
        let host_id = resolve_host_id(&config.sequencer);
        let solver = CoordinateSolver::new(&config.geometry);
        let (state_tx, _) = watch::channel(SequencerState::NotStarted);
        let (abort_tx, _) = watch::channel(false);
        Self {
            stages,
            camera,
            config,
            solver,
            host_id,
            state_tx,
            abort_tx: Arc::new(abort_tx),
        }
    }

    /// Current state.
    pub fn state(&self) -> SequencerState {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SequencerState> {
        self.state_tx.subscribe()
    }

    /// Handle for aborting runs from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: self.abort_tx.clone(),
        }
    }

    /// Host id used in clip names.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// The stages this sequencer drives.
    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    /// Validate `scan` against the configuration and the connected axes.
    pub fn check(&self, scan: &Scan) -> std::result::Result<Vec<PlannedPoint>, SequenceError> {
        let mut required = vec![X_AXIS, THETA_AXIS];
        if self.config.sequencer.stow_after_scan || scan.points().iter().any(|p| p.z0().is_some()) {
            required.push(Z_AXIS);
        }
        for axis in required {
            self.stages
                .device(axis)
                .map_err(|e| SequenceError::new(scan.id(), e))?;
        }
        plan_scan(scan, &self.config)
    }

    /// Execute `scan` from the first point to the last.
    ///
    /// On failure every stage has been sent `stop` when the error could have
    /// left one moving; the returned error names the failing point.
    pub async fn run(&mut self, scan: &Scan) -> std::result::Result<(), SequenceError> {
        info!(scan = %scan.id(), points = scan.points().len(), captures = scan.capture_count(), "Starting scan");
        match self.execute(scan).await {
            Ok(()) => {
                self.set_state(SequencerState::Completed);
                info!(scan = %scan.id(), "Scan completed");
                Ok(())
            }
            Err(err) => {
                if err.kind().requires_stop() {
                    if let Err(stop_err) = self.stages.stop().await {
                        error!(error = %stop_err, "Failed to stop stages after scan failure");
                    }
                }
                error!(error = %err, "Scan aborted");
                self.set_state(SequencerState::Aborted(err.kind().clone()));
                Err(err)
            }
        }
    }

    /// Run each scan of `scans` in order, then start the set again as
    /// `schedule` allows.
    ///
    /// Every scan is checked before anything moves. A pass that finishes
    /// inside `min_period` waits out the remainder first. An abort during
    /// that wait ends the loop cleanly; an abort during a pass fails that
    /// scan like [`run`](Self::run). Returns the number of completed passes.
    pub async fn run_repeated(
        &mut self,
        scans: &[Scan],
        schedule: RepeatSchedule,
    ) -> std::result::Result<u32, SequenceError> {
        if scans.is_empty() || schedule.rounds == Some(0) {
            return Ok(0);
        }
        for scan in scans {
            self.check(scan)?;
        }

        let mut completed = 0;
        loop {
            let started = Instant::now();
            for scan in scans {
                self.run(scan).await?;
            }
            completed += 1;
            info!(pass = completed, scans = scans.len(), "Scan set completed");
            if schedule.rounds.is_some_and(|rounds| completed >= rounds) {
                break;
            }

            let next = started + schedule.min_period;
            let wait = next.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                info!(wait_secs = wait.as_secs(), "Waiting for the next pass");
            }
            if !self.wait_until(next).await {
                info!(passes = completed, "Repeat stopped between passes");
                break;
            }
        }
        Ok(completed)
    }

    /// Home every stage.
    pub async fn home(&self) -> Result<()> {
        self.set_state(SequencerState::Homing);
        self.guarded(self.stages.home()).await
    }

    /// Move to the configured stow position.
    pub async fn stow(&mut self) -> Result<()> {
        self.set_state(SequencerState::Stowing);
        let stow = self.config.sequencer.stow;
        let native = self.solver.to_native(stow.x, stow.y)?;
        info!(x = stow.x, y = stow.y, z = stow.z, "Stowing");
        self.reset_z_speed().await?;
        let targets = [
            (X_AXIS, native.x_stage),
            (THETA_AXIS, native.theta),
            (Z_AXIS, stow.z),
        ];
        self.guarded(self.stages.move_group(&targets, true)).await
    }

    async fn execute(&mut self, scan: &Scan) -> std::result::Result<(), SequenceError> {
        let scan_err = |e| SequenceError::new(scan.id(), e);
        self.check(scan)?;
        self.solver.reset();

        if self.config.sequencer.home_before_scan {
            self.home().await.map_err(scan_err)?;
        }

        for (i, point) in scan.points().iter().enumerate() {
            let index = i + 1;
            self.run_point(scan, index, point)
                .await
                .map_err(|e| scan_err(e).at_point(index, point.point_id()))?;
        }

        if self.config.sequencer.stow_after_scan {
            self.stow().await.map_err(scan_err)?;
        }
        Ok(())
    }

    #[instrument(skip(self, scan, point), fields(scan = %scan.id(), point_id = point.point_id()))]
    async fn run_point(&mut self, scan: &Scan, index: usize, point: &ScanPoint) -> Result<()> {
        if *self.abort_tx.borrow() {
            return Err(ScanCamError::Cancelled);
        }
        self.set_state(SequencerState::Running { point: index });
        let native = self.solver.to_native(point.x(), point.y())?;

        self.set_state(SequencerState::Moving { point: index });
        let mut targets = vec![(X_AXIS, native.x_stage), (THETA_AXIS, native.theta)];
        if let Some(z0) = point.z0() {
            self.reset_z_speed().await?;
            targets.push((Z_AXIS, z0));
        }
        self.guarded(self.stages.move_group(&targets, true)).await?;

        let Some(plan) = CapturePlan::for_point(point, &self.config.sequencer) else {
            debug!("Transit point, no capture");
            return Ok(());
        };

        let sweep = match plan.sweep {
            Some(sweep) => Some(self.start_sweep(sweep).await?),
            None => None,
        };

        self.set_state(SequencerState::Capturing { point: index });
        let name = filename_base(&self.host_id, scan.id(), index, point.point_id(), Utc::now());
        info!(name = %name, clip_secs = plan.clip_secs, "Capturing");
        let captured = self
            .guarded(
                self.camera
                    .record_video(&name, plan.clip_secs, scan.video_format_params()),
            )
            .await;

        let Some(join) = sweep else {
            return captured;
        };
        if let Err(e) = captured {
            join.abort();
            if let Err(stop_err) = self.stages.stop().await {
                error!(error = %stop_err, "Failed to stop depth sweep after capture failure");
            }
            return Err(e);
        }

        self.set_state(SequencerState::FinishingDepthMove { point: index });
        self.guarded(async {
            join.await
                .map_err(|e| ScanCamError::Transport(format!("depth move task failed: {}", e)))?
        })
        .await
    }

    /// Set the sweep speed and start the depth move; the returned task
    /// resolves when the move finishes or the stage deadline passes.
    async fn start_sweep(&self, sweep: DepthSweep) -> Result<JoinHandle<Result<()>>> {
        debug!(target = sweep.target, speed = sweep.speed, "Starting depth sweep");
        self.guarded(self.stages.device(Z_AXIS)?.set_target_speed(sweep.speed))
            .await?;
        self.guarded(self.stages.move_group(&[(Z_AXIS, sweep.target)], false))
            .await?;
        let stages = self.stages.clone();
        let timeout_secs = self.config.sequencer.stage_timeout_secs;
        Ok(tokio::spawn(async move {
            stages.wait_for_group_completion(timeout_secs).await
        }))
    }

    async fn reset_z_speed(&self) -> Result<()> {
        let z = self.stages.device(Z_AXIS)?;
        self.guarded(z.set_target_speed(self.config.sequencer.standard_z_speed))
            .await
    }

    /// Run `fut` unless the operator aborts first.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut abort = self.abort_tx.subscribe();
        tokio::select! {
            biased;
            Ok(_) = abort.wait_for(|aborted| *aborted) => {
                warn!("Abort requested");
                Err(ScanCamError::Cancelled)
            }
            result = fut => result,
        }
    }

    /// Sleep until `deadline`; `false` when aborted first.
    async fn wait_until(&self, deadline: Instant) -> bool {
        let mut abort = self.abort_tx.subscribe();
        tokio::select! {
            biased;
            Ok(_) = abort.wait_for(|aborted| *aborted) => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    fn set_state(&self, state: SequencerState) {
        debug!(state = %state, "Sequencer state");
        self.state_tx.send_replace(state);
    }
}
