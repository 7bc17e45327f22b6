mod common;

use std::time::Duration;

use common::{open_rig, SETTLE};
use mcm_host_lib::mock::{lock, MockBench};
use mcm_host_lib::serial::{MessageId, SerialError};
use mcm_host_lib::{DeviceError, DriverSettings, ErrorState, JogDirection, MotionState, SlotId, SoftLimits, StatusBits};

fn slot(n: u8) -> SlotId {
    SlotId::try_from(n).unwrap()
}

#[tokio::test]
async fn test_enable_move_and_settle() {
    let rig = open_rig().await;
    let session = &rig.session;
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Disabled);

    session.set_enable(4, true).await.unwrap();
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Idle);
    assert!(session.get_enable_state(4).await.unwrap());

    session.move_absolute(4, 1000).await.unwrap();
    let settled = session.wait_for_motion(4, SETTLE).await.unwrap();
    assert_eq!(settled, MotionState::Idle);

    let status = session.mot_status(4).await.unwrap();
    assert_eq!(status.encoder_count, 1000);
    assert!(!status.bits.on_limit());
    assert!(status.bits.contains(StatusBits::ENABLED));

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_home_resets_encoder() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(5, true).await.unwrap();
    session.move_absolute(5, 4000).await.unwrap();
    session.wait_for_motion(5, SETTLE).await.unwrap();

    session.home(5).await.unwrap();
    assert_eq!(session.wait_for_motion(5, SETTLE).await.unwrap(), MotionState::Idle);
    let status = session.mot_status(5).await.unwrap();
    assert_eq!(status.encoder_count, 0);
    assert!(status.bits.contains(StatusBits::HOMED));

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_invalid_slots_rejected() {
    let rig = open_rig().await;
    let session = &rig.session;

    for bad in [0u8, 3, 7, 255] {
        assert!(matches!(session.set_enable(bad, true).await, Err(DeviceError::InvalidSlot(n)) if n == bad));
    }
    let result = session.move_absolute(7, 10).await;
    assert!(matches!(result, Err(DeviceError::InvalidSlot(7))));
    assert_eq!(mcm_host_lib::status_code(&result), -2);
    assert!(matches!(session.mot_status(3).await, Err(DeviceError::InvalidSlot(3))));

    // Nothing reached the controller
    assert!(lock(&rig.controller()).received().is_empty());
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_motion_on_disabled_slot_is_busy() {
    let rig = open_rig().await;
    let session = &rig.session;

    assert!(matches!(session.home(6).await, Err(DeviceError::SlotBusy(_))));
    assert!(matches!(session.move_jog(6, JogDirection::Clockwise).await, Err(DeviceError::SlotBusy(_))));
    assert_eq!(session.motion_state(6).await.unwrap(), MotionState::Disabled);
    assert_eq!(lock(&rig.controller()).count_received(MessageId::MOT_MOVE_HOME), 0);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_conflicting_commands_while_jogging() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(4, true).await.unwrap();
    session.move_jog(4, JogDirection::Clockwise).await.unwrap();
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Jogging);

    assert!(matches!(session.move_absolute(4, 50).await, Err(DeviceError::SlotBusy(_))));
    assert!(matches!(session.home(4).await, Err(DeviceError::SlotBusy(_))));
    assert!(matches!(session.set_enable(4, false).await, Err(DeviceError::SlotBusy(_))));
    assert!(matches!(session.set_encoder_counter(4, 0).await, Err(DeviceError::SlotBusy(_))));
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Jogging);

    // Other slots are unaffected
    session.set_enable(5, true).await.unwrap();

    session.move_stop(4).await.unwrap();
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Idle);
    assert!(!lock(&rig.controller()).is_jogging(slot(4)));

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_stop_when_idle_sends_nothing() {
    let rig = open_rig().await;
    let session = &rig.session;

    session.move_stop(4).await.unwrap();
    session.set_enable(4, true).await.unwrap();
    session.move_stop(4).await.unwrap();
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Idle);
    assert_eq!(lock(&rig.controller()).count_received(MessageId::MOT_MOVE_STOP), 0);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_jog_stops_at_soft_limit() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(6, true).await.unwrap();
    session
        .set_soft_limit_values(6, SoftLimits { cw: Some(250), ccw: None })
        .await
        .unwrap();

    session.move_jog(6, JogDirection::Clockwise).await.unwrap();
    // Jogs are not waited for
    assert_eq!(session.wait_for_motion(6, SETTLE).await.unwrap(), MotionState::Jogging);

    let mut state = MotionState::Jogging;
    for _ in 0..10 {
        state = session.refresh_state(6).await.unwrap();
        if state == MotionState::Idle {
            break;
        }
    }
    assert_eq!(state, MotionState::Idle);

    let status = session.mot_status(6).await.unwrap();
    assert_eq!(status.encoder_count, 250);
    assert!(status.bits.contains(StatusBits::CW_SOFT_LIMIT));
    assert!(!status.bits.is_jogging());

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_device_rejection_restores_state() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(4, true).await.unwrap();

    // Outside the stage's travel
    let result = session.move_absolute(4, 600_000).await;
    assert!(matches!(result, Err(DeviceError::OutOfRange(_))));
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Idle);
    assert_eq!(session.error_state(), ErrorState::Ok);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_fault_event_puts_slot_in_error() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(5, true).await.unwrap();
    lock(&rig.controller()).fail_next_motion(slot(5));

    session.home(5).await.unwrap();
    assert_eq!(session.wait_for_motion(5, SETTLE).await.unwrap(), MotionState::Error);
    assert!(matches!(session.move_absolute(5, 10).await, Err(DeviceError::DeviceFault(_))));
    assert_eq!(session.motion_state(5).await.unwrap(), MotionState::Error);

    // Re-enabling clears the fault
    session.set_enable(5, true).await.unwrap();
    session.home(5).await.unwrap();
    assert_eq!(session.wait_for_motion(5, SETTLE).await.unwrap(), MotionState::Idle);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_link_failure_leaves_state_unknown() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(4, true).await.unwrap();

    lock(&rig.controller()).set_link_down(true);
    let result = session.move_absolute(4, 100).await;
    assert!(matches!(result, Err(DeviceError::Transport(SerialError::IoError(_)))));
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Unknown);
    assert!(matches!(session.error_state(), ErrorState::LinkFault(_)));
    assert!(rig.manager.is_open(common::SERIAL).await);

    lock(&rig.controller()).set_link_down(false);
    assert_eq!(session.refresh_state(4).await.unwrap(), MotionState::Idle);
    assert_eq!(session.error_state(), ErrorState::Ok);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_velocity_moves() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(4, true).await.unwrap();

    assert!(matches!(
        session.set_velocity(4, JogDirection::Clockwise, 101).await,
        Err(DeviceError::OutOfRange(_))
    ));
    session.set_velocity(4, JogDirection::Clockwise, 50).await.unwrap();
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Jogging);

    session.set_velocity(4, JogDirection::Clockwise, 0).await.unwrap();
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Idle);
    assert!(!lock(&rig.controller()).is_jogging(slot(4)));

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_encoder_counter_and_identify() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_encoder_counter(4, 5000).await.unwrap();
    assert_eq!(session.slot(4).await.unwrap().encoder_count, 5000);
    assert_eq!(session.mot_status(4).await.unwrap().encoder_count, 5000);

    session.identify(4).await.unwrap();
    assert_eq!(lock(&rig.controller()).count_received(MessageId::MOD_IDENTIFY), 1);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_restart_disables_every_slot() {
    let rig = open_rig().await;
    let session = &rig.session;
    for n in 4..=6 {
        session.set_enable(n, true).await.unwrap();
    }
    session.restart_board().await.unwrap();

    for n in 4..=6 {
        assert_eq!(session.motion_state(n).await.unwrap(), MotionState::Disabled);
        assert!(!lock(&rig.controller()).is_enabled(slot(n)));
    }

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_timeout_keeps_session_open() {
    let rig = open_rig().await;
    let session = &rig.session;
    lock(&rig.controller()).set_silent(true);

    let result = session.mot_status(4).await;
    assert!(matches!(result, Err(DeviceError::Transport(SerialError::Timeout))));
    assert_eq!(rig.manager.get_error_state(rig.handle).await.unwrap(), ErrorState::Timeout);
    assert!(rig.manager.is_open(common::SERIAL).await);

    lock(&rig.controller()).set_silent(false);
    session.mot_status(4).await.unwrap();
    assert_eq!(rig.manager.get_error_state(rig.handle).await.unwrap(), ErrorState::Ok);

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_second_command_on_busy_slot_fails_fast() {
    let rig = open_rig().await;
    let session = &rig.session;
    lock(&rig.controller()).set_silent(true);

    let (first, second) = tokio::join!(session.get_jog_params(4), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.set_jog_params(4, 10).await
    });
    assert!(matches!(first, Err(DeviceError::Transport(SerialError::Timeout))));
    assert!(matches!(second, Err(DeviceError::SlotBusy(_))));

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_stop_event_does_not_end_next_move() {
    let rig = open_rig().await;
    let session = &rig.session;
    lock(&rig.controller()).set_hold_moves(true);

    session.set_enable(4, true).await.unwrap();
    session.move_jog(4, JogDirection::Clockwise).await.unwrap();
    session.move_stop(4).await.unwrap();
    session.move_absolute(4, 1000).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(lock(&rig.controller()).is_moving(slot(4)));
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Moving);
    assert!(matches!(session.move_absolute(4, 2000).await, Err(DeviceError::SlotBusy(_))));
    assert!(session.wait_for_motion(4, Duration::from_millis(200)).await.is_err());

    session.move_stop(4).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.motion_state(4).await.unwrap(), MotionState::Idle);
    assert!(!lock(&rig.controller()).is_moving(slot(4)));

    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_late_error_for_other_slot_is_not_taken() {
    common::init_logging();
    let bench = MockBench::new(&[common::SERIAL]);
    let settings = DriverSettings {
        stale_reply_ms: 1,
        ..DriverSettings::default()
    };
    let manager = bench.manager_with(settings);
    let handle = manager.open(common::SERIAL, 115200, 1).await.unwrap();
    let session = manager.session(handle).await.unwrap();
    let controller = bench.controller(common::SERIAL).unwrap();

    lock(&controller).remove_stage(slot(5));
    session.set_enable(4, true).await.unwrap();
    session.set_enable(5, true).await.unwrap();

    // Refused home on slot 5 answers after the timeout
    lock(&controller).delay_next_reply(Duration::from_millis(1100));
    assert!(matches!(session.home(5).await, Err(DeviceError::Transport(SerialError::Timeout))));

    // Slot 4's ack comes in after that error
    lock(&controller).delay_next_reply(Duration::from_millis(300));
    session.home(4).await.unwrap();
    assert_eq!(session.wait_for_motion(4, SETTLE).await.unwrap(), MotionState::Idle);
    assert!(session.metrics().unexpected_frames >= 1);

    manager.close_all().await;
}
