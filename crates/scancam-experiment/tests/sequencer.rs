//! Scan sequencer against the emulated stage chain and mock camera.

use chrono::NaiveDateTime;
use scancam_core::{ScanCamConfig, ScanCamError};
use scancam_driver_mock::{MockAxisConfig, MockCamera, MockChain, MockChainBuilder};
use scancam_driver_zaber::{MoveCommand, Setting, StageSet};
use scancam_experiment::{RepeatSchedule, Scan, ScanPoint, ScanSequencer, SequencerState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

const X: u8 = 1;
const THETA: u8 = 2;
const Z: u8 = 3;

fn config(extra: &str) -> ScanCamConfig {
    let toml = format!(
        "[sequencer]\nhost_id = \"rig1\"\nstage_timeout_secs = 10\n{}",
        extra
    );
    ScanCamConfig::from_toml_str(&toml).unwrap()
}

fn chain() -> MockChainBuilder {
    MockChain::builder().axis(X).axis(THETA).axis(Z)
}

async fn rig(builder: MockChainBuilder, config: &ScanCamConfig) -> (MockChain, StageSet) {
    let (chain, transport) = builder.connect();
    let stages = StageSet::connect(config, transport).await.unwrap();
    (chain, stages)
}

fn absolute_moves(chain: &MockChain, address: u8) -> Vec<i32> {
    chain
        .received_by(address)
        .iter()
        .filter(|p| p.command == MoveCommand::Absolute.code())
        .map(|p| p.data)
        .collect()
}

fn stops(chain: &MockChain, address: u8) -> usize {
    chain
        .received_by(address)
        .iter()
        .filter(|p| p.command == MoveCommand::Stop.code())
        .count()
}

fn scan(points: Vec<ScanPoint>) -> Scan {
    Scan::new("plate", points, None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_depth_sweep_is_clamped_and_clip_extended() {
    let config = config("");
    let (chain, stages) = rig(chain(), &config).await;
    let z = stages.device("z").unwrap().clone();
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);

    let point = ScanPoint::builder(60.0, 0.0).z0(0.0).z1(9.0).t(1.0).build().unwrap();
    sequencer.run(&scan(vec![point])).await.unwrap();

    let recordings = camera.recordings();
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0].clip_duration_secs, 3);

    let expected_speed = (3.0 * z.microsteps_per_unit() / 9.375).round() as i32;
    assert_eq!(chain.setting(Z, Setting::TargetSpeed), Some(expected_speed));
    assert_eq!(
        absolute_moves(&chain, Z),
        [z.move_data(MoveCommand::Absolute, 0.0), z.move_data(MoveCommand::Absolute, 9.0)]
    );
    assert_eq!(chain.position(Z), Some(z.move_data(MoveCommand::Absolute, 9.0)));
    assert_eq!(sequencer.state(), SequencerState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_point_without_t_never_captures_or_sweeps() {
    let config = config("");
    let (chain, stages) = rig(chain(), &config).await;
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);

    let point = ScanPoint::builder(60.0, 0.0).z0(2.0).z1(5.0).build().unwrap();
    sequencer.run(&scan(vec![point])).await.unwrap();

    assert_eq!(camera.capture_count(), 0);
    assert_eq!(absolute_moves(&chain, Z).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_still_image_skips_depth_sweep() {
    let config = config("");
    let (chain, stages) = rig(chain(), &config).await;
    let z = stages.device("z").unwrap().clone();
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);

    let point = ScanPoint::builder(60.0, 0.0).z0(2.0).z1(5.0).t(0.0).build().unwrap();
    sequencer.run(&scan(vec![point])).await.unwrap();

    let recordings = camera.recordings();
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0].clip_duration_secs, 0);
    assert_eq!(absolute_moves(&chain, Z), [z.move_data(MoveCommand::Absolute, 2.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_clip_names() {
    let config = config("");
    let (_chain, stages) = rig(chain(), &config).await;
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);

    let points = vec![
        ScanPoint::builder(60.0, 0.0).t(2.0).point_id("A1").build().unwrap(),
        ScanPoint::builder(62.0, 0.0).t(2.9).build().unwrap(),
    ];
    sequencer.run(&scan(points)).await.unwrap();

    let recordings = camera.recordings();
    assert_eq!(recordings.len(), 2);
    assert_eq!(recordings[1].clip_duration_secs, 2);
    for (recording, prefix) in recordings.iter().zip(["rig1_plate_A1.", "rig1_plate_2."]) {
        let stamp = recording
            .name_base
            .strip_prefix(prefix)
            .unwrap_or_else(|| panic!("unexpected name {}", recording.name_base));
        assert!(NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d_%H-%M-%S").is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn test_depth_axis_moves_during_capture() {
    let config = config("");
    let slow_z = MockAxisConfig {
        move_duration: Some(Duration::from_secs(2)),
        ..MockAxisConfig::new(Z)
    };
    let builder = MockChain::builder().axis(X).axis(THETA).axis_config(slow_z);
    let (chain, stages) = rig(builder, &config).await;

    let z = stages.device("z").unwrap().clone();
    let z_was_moving = Arc::new(AtomicBool::new(false));
    let seen = z_was_moving.clone();
    let camera = MockCamera::new().on_capture(move |_| seen.store(z.in_action(), Ordering::SeqCst));
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera), config);

    let point = ScanPoint::builder(60.0, 0.0).z0(1.0).z1(2.0).t(4.0).build().unwrap();
    sequencer.run(&scan(vec![point])).await.unwrap();

    assert!(z_was_moving.load(Ordering::SeqCst));
    assert!(!chain.is_moving(Z));
    assert_eq!(absolute_moves(&chain, Z).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_aborts_and_stops_everything() {
    let config = config("home_before_scan = false\n");
    let stuck_z = MockAxisConfig {
        move_duration: Some(Duration::from_secs(500)),
        ..MockAxisConfig::new(Z)
    };
    let builder = MockChain::builder().axis(X).axis(THETA).axis_config(stuck_z);
    let (chain, stages) = rig(builder, &config).await;
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);

    let points = vec![
        ScanPoint::builder(60.0, 0.0).z0(3.0).t(1.0).point_id("first").build().unwrap(),
        ScanPoint::builder(62.0, 0.0).t(1.0).build().unwrap(),
    ];
    let err = sequencer.run(&scan(points)).await.unwrap_err();
    // stop is sent without waiting for the reply
    sleep(Duration::from_millis(50)).await;

    assert_eq!(err.kind(), &ScanCamError::DeviceTimeout("z".into()));
    assert_eq!(err.point_index, Some(1));
    assert_eq!(err.point_id.as_deref(), Some("first"));
    assert_eq!(camera.capture_count(), 0);
    for address in [X, THETA, Z] {
        assert!(stops(&chain, address) >= 1, "no stop sent to {}", address);
    }
    assert!(!chain.is_moving(Z));
    assert!(matches!(sequencer.state(), SequencerState::Aborted(ScanCamError::DeviceTimeout(_))));
}

#[tokio::test(start_paused = true)]
async fn test_operator_abort_stops_motion() {
    let config = config("");
    let slow_z = MockAxisConfig {
        move_duration: Some(Duration::from_secs(8)),
        ..MockAxisConfig::new(Z)
    };
    let builder = MockChain::builder().axis(X).axis(THETA).axis_config(slow_z);
    let (chain, stages) = rig(builder, &config).await;
    let mut sequencer = ScanSequencer::new(stages, Arc::new(MockCamera::new()), config);
    let abort = sequencer.abort_handle();

    let point = ScanPoint::builder(60.0, 0.0).z0(3.0).build().unwrap();
    let scan = scan(vec![point]);
    let (result, _) = tokio::join!(sequencer.run(&scan), async {
        sleep(Duration::from_secs(1)).await;
        abort.abort();
    });

    sleep(Duration::from_millis(50)).await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), &ScanCamError::Cancelled);
    assert!(stops(&chain, Z) >= 1);
    assert!(!chain.is_moving(Z));
    assert!(abort.is_aborted());
}

#[tokio::test(start_paused = true)]
async fn test_home_and_stow() {
    let config = config("stow_after_scan = true\n");
    let (chain, stages) = rig(chain(), &config).await;
    let z = stages.device("z").unwrap().clone();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(MockCamera::new()), config);
    let mut states = sequencer.subscribe();

    sequencer.run(&scan(vec![ScanPoint::at(60.0, 0.0).unwrap()])).await.unwrap();

    for address in [X, THETA, Z] {
        assert!(chain
            .received_by(address)
            .iter()
            .any(|p| p.command == 1), "axis {} was not homed", address);
    }
    assert_eq!(chain.position(Z), Some(z.move_data(MoveCommand::Absolute, 5.0)));
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SequencerState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_long_clip_rejected_before_anything_moves() {
    let config = config("max_clip_length = 5.0\n");
    let (chain, stages) = rig(chain(), &config).await;
    let mut sequencer = ScanSequencer::new(stages, Arc::new(MockCamera::new()), config);
    let before = chain.received().len();

    let point = ScanPoint::builder(60.0, 0.0).t(10.0).build().unwrap();
    let err = sequencer.run(&scan(vec![point])).await.unwrap_err();

    assert!(matches!(err.kind(), ScanCamError::InvalidScanPoint(_)));
    assert_eq!(chain.received().len(), before);
}

fn named_scan(id: &str, x: f64) -> Scan {
    let point = ScanPoint::builder(x, 0.0).t(1.0).build().unwrap();
    Scan::new(id, vec![point], None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_scan_set_repeats_no_faster_than_min_period() {
    let config = config("");
    let (_chain, stages) = rig(chain(), &config).await;
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);

    let scans = [named_scan("a", 60.0), named_scan("b", 70.0)];
    let schedule = RepeatSchedule {
        rounds: Some(2),
        min_period: Duration::from_secs(120),
    };
    let started = Instant::now();
    let passes = sequencer.run_repeated(&scans, schedule).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(passes, 2);
    let names: Vec<_> = camera
        .recordings()
        .iter()
        .map(|r| r.name_base.split('.').next().unwrap().to_string())
        .collect();
    assert_eq!(names, ["rig1_a_1", "rig1_b_1", "rig1_a_1", "rig1_b_1"]);
    // The second pass starts a full period after the first, then runs
    assert!(elapsed >= Duration::from_secs(120), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(240), "{:?}", elapsed);
    assert_eq!(sequencer.state(), SequencerState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_waiting_ends_repeat() {
    let config = config("");
    let (chain, stages) = rig(chain(), &config).await;
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);
    let abort = sequencer.abort_handle();

    let scans = [named_scan("a", 60.0)];
    let schedule = RepeatSchedule::forever(Duration::from_secs(600));
    let started = Instant::now();
    let (result, _) = tokio::join!(sequencer.run_repeated(&scans, schedule), async {
        sleep(Duration::from_secs(300)).await;
        abort.abort();
    });

    assert_eq!(result.unwrap(), 1);
    assert_eq!(camera.capture_count(), 1);
    assert!(started.elapsed() < Duration::from_secs(600));
    assert_eq!(stops(&chain, X), 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_checks_every_scan_first() {
    let config = config("");
    let (chain, stages) = rig(chain(), &config).await;
    let camera = MockCamera::new();
    let mut sequencer = ScanSequencer::new(stages, Arc::new(camera.clone()), config);
    let before = chain.received().len();

    let far = Scan::new("far", vec![ScanPoint::at(500.0, 0.0).unwrap()], None).unwrap();
    let scans = [named_scan("a", 60.0), far];
    let err = sequencer
        .run_repeated(&scans, RepeatSchedule::once())
        .await
        .unwrap_err();

    assert!(matches!(err.kind(), ScanCamError::UnreachablePosition { .. }));
    assert_eq!(camera.capture_count(), 0);
    assert_eq!(chain.received().len(), before);
}
