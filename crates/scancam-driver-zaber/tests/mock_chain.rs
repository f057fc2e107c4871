//! Device protocol over the emulated controller chain.

use scancam_core::config::ProtocolConfig;
use scancam_core::{RunMode, ScanCamError, StageConfig, StageUnits};
use scancam_driver_mock::{ErrorConfig, ErrorScenario, MockChain};
use scancam_driver_zaber::{
    BaseCommand, CommandKind, DeviceOptions, MetaCommand, MoveCommand, Setting, StageSet,
    ZaberDevice,
};
use std::time::Duration;
use tracing_test::traced_test;

fn stage(axis: &str, address: u8, run_mode: RunMode) -> StageConfig {
    StageConfig {
        axis: axis.into(),
        address,
        units: StageUnits::Linear { mm_per_step: 0.01 },
        controller: Default::default(),
        run_mode,
    }
}

#[tokio::test(start_paused = true)]
async fn test_initialise_reads_every_setting() {
    let (chain, transport) = MockChain::builder().axis(1).connect();
    let device = ZaberDevice::attach_from_config(
        &stage("X", 1, RunMode::Stepped),
        &ProtocolConfig::default(),
        transport,
    )
    .await
    .unwrap();

    assert!(device.is_initialised());
    assert_eq!(device.setting(Setting::MicrostepResolution), Some(64));
    assert!((device.microsteps_per_unit() - 6400.0).abs() < 1e-9);
    assert_eq!(
        chain
            .received_by(1)
            .iter()
            .filter(|p| p.command == BaseCommand::ReturnSetting.code())
            .count(),
        Setting::count()
    );
}

#[tokio::test(start_paused = true)]
async fn test_stepped_queue_runs_one_command_per_step() {
    let (chain, transport) = MockChain::builder()
        .axis(1)
        .move_duration(Duration::from_millis(200))
        .connect();
    let device = ZaberDevice::attach_from_config(
        &stage("X", 1, RunMode::Stepped),
        &ProtocolConfig::default(),
        transport,
    )
    .await
    .unwrap();

    for target in [1.0, 2.0, 3.0] {
        device.enqueue_move(MoveCommand::Absolute, target).await.unwrap();
    }
    assert_eq!(device.queue_len(), 3);

    let mut positions = Vec::new();
    while device.queue_len() > 0 {
        device.step().await.unwrap();
        device.wait_for_action_to_complete(5).await.unwrap();
        positions.push(chain.position(1).unwrap());
    }
    assert_eq!(positions, [6400, 12800, 19200]);
}

#[tokio::test(start_paused = true)]
async fn test_meta_command_pauses_at_marked_steps() {
    let (chain, transport) = MockChain::builder().axis(1).connect();
    let device = ZaberDevice::attach_from_config(
        &stage("X", 1, RunMode::Stepped),
        &ProtocolConfig::default(),
        transport,
    )
    .await
    .unwrap();

    // Two relative moves run back to back, then the sequence waits for a step
    let nudge = MetaCommand::new("nudge")
        .then_move(MoveCommand::Relative, 0.5)
        .then_move(MoveCommand::Relative, 0.5)
        .pause();
    device.run_meta(&nudge.repeat(2)).await.unwrap();
    assert_eq!(device.queue_len(), 4);

    device.step().await.unwrap();
    device.wait_for_action_to_complete(5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(chain.position(1), Some(6400));
    assert_eq!(device.queue_len(), 2);

    device.step().await.unwrap();
    device.wait_for_action_to_complete(5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(chain.position(1), Some(12800));
    assert_eq!(device.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_busy_reply_is_resent_with_backoff() {
    let errors = ErrorConfig::scenario(ErrorScenario::Busy {
        address: 1,
        times: 2,
    });
    let (chain, transport) = MockChain::builder().axis(1).errors(errors).connect();
    let device = ZaberDevice::new("X", 1, transport, DeviceOptions::default());

    let start = tokio::time::Instant::now();
    assert_eq!(device.get(Setting::TargetSpeed).await.unwrap(), 2922);
    // 50 ms then 100 ms
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert_eq!(chain.received_by(1).len(), 3);
    assert!(logs_contain("Device busy, resending"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_busy_retries_are_bounded() {
    let errors = ErrorConfig::scenario(ErrorScenario::Busy {
        address: 1,
        times: u32::MAX,
    });
    let (chain, transport) = MockChain::builder().axis(1).errors(errors).connect();
    let protocol = ProtocolConfig {
        blocking_retries: 1,
        ..ProtocolConfig::default()
    };
    let options = DeviceOptions {
        protocol,
        ..DeviceOptions::default()
    };
    let device = ZaberDevice::new("X", 1, transport, options);

    let err = device.get(Setting::TargetSpeed).await.unwrap_err();
    assert!(matches!(
        err,
        ScanCamError::DeviceCommand { code: 53, subcode: 255, .. }
    ));
    // First send plus five resends
    assert_eq!(chain.received_by(1).len(), 6);
    assert!(!device.in_action());
    assert!(logs_contain("not retrying"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_rejected_move_is_terminal_and_logged() {
    let errors = ErrorConfig::scenario(ErrorScenario::Reject {
        address: 1,
        command: MoveCommand::StoredPosition.code(),
        subcode: 1801,
    });
    let (_chain, transport) = MockChain::builder().axis(1).errors(errors).connect();
    let options = DeviceOptions {
        run_mode: RunMode::Continuous,
        ..DeviceOptions::default()
    };
    let device = ZaberDevice::new("X", 1, transport, options);

    let err = device
        .send_now(MoveCommand::StoredPosition.code(), 2, true, true, 18)
        .await
        .unwrap_err();
    match err {
        ScanCamError::DeviceCommand {
            code,
            subcode,
            description,
            ..
        } => {
            assert_eq!(code, 18);
            assert_eq!(subcode, 1801);
            assert_eq!(description, "move_position_not_homed");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(device.faults().len(), 1);
    assert!(!device.in_action());
    assert!(logs_contain("Device rejected command"));

    // The device keeps working after a rejection
    device
        .enqueue(CommandKind::Move(MoveCommand::Absolute), 100)
        .await
        .unwrap();
    device.wait_for_action_to_complete(1).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reset_leaves_device_idle() {
    let (chain, transport) = MockChain::builder().axis(1).connect();
    let device = ZaberDevice::attach_from_config(
        &stage("X", 1, RunMode::Continuous),
        &ProtocolConfig::default(),
        transport,
    )
    .await
    .unwrap();
    device.enqueue_move(MoveCommand::Absolute, 1.0).await.unwrap();
    device.wait_for_action_to_complete(5).await.unwrap();

    device
        .enqueue(CommandKind::Base(BaseCommand::Reset), 0)
        .await
        .unwrap();
    assert!(!device.in_action());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(chain.position(1), Some(0));

    // The queue keeps working after the unanswered reset
    device.enqueue_move(MoveCommand::Absolute, 2.0).await.unwrap();
    device.wait_for_action_to_complete(5).await.unwrap();
    assert_eq!(chain.position(1), Some(12800));
}

#[tokio::test(start_paused = true)]
async fn test_stage_set_moves_group_in_physical_units() {
    let config = scancam_core::ScanCamConfig::from_toml_str(
        r#"
        [[stages]]
        axis = "X"
        address = 1
        units = { kind = "linear", mm_per_step = 0.01 }

        [[stages]]
        axis = "z"
        address = 3
        units = { kind = "linear", mm_per_step = 0.01 }
        "#,
    )
    .unwrap();
    let (chain, transport) = MockChain::builder()
        .axis(1)
        .axis(3)
        .move_duration(Duration::from_millis(300))
        .connect();
    let stages = StageSet::connect(&config, transport).await.unwrap();

    stages.move_group(&[("X", 2.0), ("z", -1.5)], true).await.unwrap();
    assert_eq!(chain.position(1), Some(12800));
    assert_eq!(chain.position(3), Some(-9600));
    assert!(!stages.in_action());
}
