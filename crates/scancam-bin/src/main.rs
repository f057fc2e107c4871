//! CLI Entry Point for scancam
//!
//! Provides command-line interface for:
//! - Running scans on the rig (or on the emulated chain with `--mock`)
//! - Homing and stowing the stages
//! - Solving targets and checking scan files offline
//!
//! # Usage
//!
//! ```bash
//! scancam run plate.json --config config/scancam.toml
//! scancam run plate-a.json plate-b.json --repeat 0 --min-period 30
//! scancam solve 80 -20
//! scancam check plate.json
//! ```
//!
//! Ctrl-C during a run stops every stage and closes the serial link.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scancam_core::config::{ApplicationConfig, DEFAULT_CONFIG_PATH};
use scancam_core::{Camera, ScanCamConfig};
use scancam_driver_mock::{MockCamera, MockChain, MockMode};
use scancam_driver_zaber::{available_ports, SerialTransport, StageSet, Transport};
use scancam_experiment::{
    plan_scan, CommandCamera, CoordinateSolver, RepeatSchedule, Scan, ScanSequencer,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scancam")]
#[command(about = "Stage and camera control for the scanning plate imager", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Drive the emulated stage chain and a mock camera instead of hardware
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one or more scan files in order
    Run {
        /// Paths to scan JSON
        #[arg(required = true)]
        scans: Vec<PathBuf>,

        /// Passes over the scan set; 0 repeats until Ctrl-C
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Minimum minutes between the starts of consecutive passes
        #[arg(long, value_name = "MINUTES", default_value_t = 0.0)]
        min_period: f64,

        /// Skip homing before the first point
        #[arg(long)]
        no_home: bool,

        /// Return to the stow position after the last point
        #[arg(long)]
        stow: bool,
    },

    /// Home every stage
    Home,

    /// Move to the configured stow position
    Stow,

    /// Print the rig coordinates for a Cartesian target
    #[command(allow_negative_numbers = true)]
    Solve {
        /// x (mm)
        x: f64,
        /// y (mm)
        y: f64,
    },

    /// Validate a scan file and solve every point without moving anything
    Check {
        /// Path to scan JSON
        scan: PathBuf,
    },

    /// List serial ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ScanCamConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_logging(&config.application);
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Run {
            scans,
            repeat,
            min_period,
            no_home,
            stow,
        } => {
            let schedule = repeat_schedule(repeat, min_period)?;
            run_scans(config, cli.mock, scans, schedule, no_home, stow).await
        }
        Commands::Home => home(config, cli.mock).await,
        Commands::Stow => stow(config, cli.mock).await,
        Commands::Solve { x, y } => solve(&config, x, y),
        Commands::Check { scan } => check(&config, scan),
        Commands::Ports => list_ports(),
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(app: &ApplicationConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&app.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if app.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Connected hardware, real or emulated.
struct Rig {
    stages: StageSet,
    camera: Arc<dyn Camera>,
    transport: Arc<dyn Transport>,
    // Keeps the emulated chain alive
    _chain: Option<MockChain>,
}

impl Rig {
    async fn connect(config: &ScanCamConfig, mock: bool) -> Result<Self> {
        tracing::info!(mock, stages = config.stages.len(), "Connecting rig");
        let transport: Arc<dyn Transport>;
        let camera: Arc<dyn Camera>;
        let mut chain = None;
        if mock {
            println!("🔧 Using emulated stage chain and mock camera");
            let (emulated, link) = config
                .stages
                .iter()
                .fold(MockChain::builder(), |b, stage| b.axis(stage.address))
                .mode(MockMode::Realistic)
                .connect();
            transport = link;
            camera = Arc::new(MockCamera::new().with_mode(MockMode::Realistic));
            chain = Some(emulated);
        } else {
            println!("🔧 Opening {}", config.serial.port);
            transport = SerialTransport::open(&config.serial)
                .await
                .with_context(|| format!("opening stage chain on {}", config.serial.port))?;
            camera = Arc::new(CommandCamera::new(&config.camera));
        }

        let stages = StageSet::connect(config, transport.clone())
            .await
            .context("initialising stages")?;
        println!("✅ Stages ready: {}", stages.axes().join(", "));
        Ok(Self {
            stages,
            camera,
            transport,
            _chain: chain,
        })
    }
}

fn repeat_schedule(repeat: u32, min_period_minutes: f64) -> Result<RepeatSchedule> {
    let min_period = Duration::try_from_secs_f64(min_period_minutes * 60.0)
        .with_context(|| format!("invalid --min-period {}", min_period_minutes))?;
    Ok(RepeatSchedule {
        rounds: (repeat > 0).then_some(repeat),
        min_period,
    })
}

async fn run_scans(
    mut config: ScanCamConfig,
    mock: bool,
    scan_paths: Vec<PathBuf>,
    schedule: RepeatSchedule,
    no_home: bool,
    stow: bool,
) -> Result<()> {
    let mut scans = Vec::with_capacity(scan_paths.len());
    for path in &scan_paths {
        let scan = Scan::from_json_file(path)
            .with_context(|| format!("reading scan {}", path.display()))?;
        println!(
            "📜 Scan '{}': {} points, {} captures",
            scan.id(),
            scan.points().len(),
            scan.capture_count()
        );
        scans.push(scan);
    }
    match schedule.rounds {
        Some(1) => {}
        Some(n) => println!("🔁 {} passes, at least {:?} apart", n, schedule.min_period),
        None => println!("🔁 Repeating until Ctrl-C, at least {:?} apart", schedule.min_period),
    }
    if no_home {
        config.sequencer.home_before_scan = false;
    }
    if stow {
        config.sequencer.stow_after_scan = true;
    }

    let rig = Rig::connect(&config, mock).await?;
    let transport = rig.transport.clone();
    let mut sequencer = ScanSequencer::new(rig.stages, rig.camera, config);

    let abort = sequencer.abort_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Abort requested, stopping stages...");
            abort.abort();
        }
    });

    // Runs across every scan of every pass; aborted once the loop returns
    let mut states = sequencer.subscribe();
    let progress = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            println!("   {}", state);
        }
    });

    let result = sequencer.run_repeated(&scans, schedule).await;
    transport.close().await;
    progress.abort();

    match result {
        Ok(passes) => {
            println!("✅ Completed {} pass(es) over {} scan(s)", passes, scans.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            Err(e.into())
        }
    }
}

async fn home(config: ScanCamConfig, mock: bool) -> Result<()> {
    let rig = Rig::connect(&config, mock).await?;
    let sequencer = ScanSequencer::new(rig.stages.clone(), rig.camera, config);
    println!("🏠 Homing...");
    let result = tokio::select! {
        r = sequencer.home() => r,
        _ = signal::ctrl_c() => {
            println!("\n🛑 Interrupted, stopping stages...");
            rig.stages.stop().await.map_err(anyhow::Error::from)?;
            Err(scancam_core::ScanCamError::Cancelled)
        }
    };
    rig.transport.close().await;
    result?;
    println!("✅ Homed");
    Ok(())
}

async fn stow(config: ScanCamConfig, mock: bool) -> Result<()> {
    let rig = Rig::connect(&config, mock).await?;
    let mut sequencer = ScanSequencer::new(rig.stages.clone(), rig.camera, config);
    println!("📦 Stowing...");
    let result = tokio::select! {
        r = sequencer.stow() => r,
        _ = signal::ctrl_c() => {
            println!("\n🛑 Interrupted, stopping stages...");
            rig.stages.stop().await.map_err(anyhow::Error::from)?;
            Err(scancam_core::ScanCamError::Cancelled)
        }
    };
    rig.transport.close().await;
    result?;
    println!("✅ Stowed");
    Ok(())
}

fn solve(config: &ScanCamConfig, x: f64, y: f64) -> Result<()> {
    let mut solver = CoordinateSolver::new(&config.geometry);
    let native = solver.to_native(x, y)?;
    println!("X     = {:.4} mm", native.x_stage);
    println!("theta = {:.4} deg", native.theta);
    Ok(())
}

fn check(config: &ScanCamConfig, scan_path: PathBuf) -> Result<()> {
    let scan = Scan::from_json_file(&scan_path)
        .with_context(|| format!("reading scan {}", scan_path.display()))?;
    let planned = plan_scan(&scan, config)?;

    println!("Scan '{}' ({} points)", scan.id(), planned.len());
    for (point, plan) in scan.points().iter().zip(&planned) {
        let capture = match &plan.capture {
            None => "transit".to_string(),
            Some(c) if c.clip_secs == 0 => "still".to_string(),
            Some(c) => match c.sweep {
                Some(s) => format!("{} s clip, z -> {} at {:.3} mm/s", c.clip_secs, s.target, s.speed),
                None => format!("{} s clip", c.clip_secs),
            },
        };
        println!(
            "  {:>4} {:<12} X={:>9.3} theta={:>8.3}  {}",
            plan.index,
            point.point_id().unwrap_or("-"),
            plan.native.x_stage,
            plan.native.theta,
            capture
        );
    }
    println!("✅ All points reachable");
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}
