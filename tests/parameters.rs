mod common;

use common::{open_rig, SETTLE};
use mcm_host_lib::stage::params::{CCW_LIMIT_ABSENT, CW_LIMIT_ABSENT};
use mcm_host_lib::{DeviceError, HomeDirection, PersistKind, SoftLimitMode, SoftLimits};

#[tokio::test]
async fn test_jog_params_round_trip_and_dirty_flag() {
    let rig = open_rig().await;
    let session = &rig.session;

    assert_eq!(session.get_jog_params(4).await.unwrap(), 100);
    assert!(!session.is_dirty(4, PersistKind::JogParams).await.unwrap());

    session.set_jog_params(4, 250).await.unwrap();
    assert_eq!(session.get_jog_params(4).await.unwrap(), 250);
    assert_eq!(session.parameters(4).await.unwrap().jog_step, Some(250));
    assert!(session.is_dirty(4, PersistKind::JogParams).await.unwrap());

    session.commit(4, PersistKind::JogParams).await.unwrap();
    assert!(!session.is_dirty(4, PersistKind::JogParams).await.unwrap());

    assert!(matches!(session.set_jog_params(4, 0).await, Err(DeviceError::OutOfRange(_))));
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_soft_limits_default_to_absent() {
    let rig = open_rig().await;
    let limits = rig.session.get_soft_limits(5).await.unwrap();
    assert_eq!(limits, SoftLimits::default());
    assert_eq!(limits.raw(), (CW_LIMIT_ABSENT, CCW_LIMIT_ABSENT));
    assert_eq!((CW_LIMIT_ABSENT, CCW_LIMIT_ABSENT), (i32::MAX, i32::MIN));
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_soft_limits_from_current_position() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_enable(4, true).await.unwrap();

    session.move_absolute(4, 1000).await.unwrap();
    session.wait_for_motion(4, SETTLE).await.unwrap();
    session.set_soft_limit(4, SoftLimitMode::SetCwFromCurrent).await.unwrap();

    session.move_absolute(4, 200).await.unwrap();
    session.wait_for_motion(4, SETTLE).await.unwrap();
    session.set_soft_limit(4, SoftLimitMode::SetCcwFromCurrent).await.unwrap();

    let limits = session.get_soft_limits(4).await.unwrap();
    assert_eq!(limits, SoftLimits { cw: Some(1000), ccw: Some(200) });

    // A move past the limit stops on it
    session.move_absolute(4, 5000).await.unwrap();
    session.wait_for_motion(4, SETTLE).await.unwrap();
    assert_eq!(session.mot_status(4).await.unwrap().encoder_count, 1000);

    session.set_soft_limit(4, SoftLimitMode::ClearBoth).await.unwrap();
    assert_eq!(session.get_soft_limits(4).await.unwrap(), SoftLimits::default());
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_soft_limit_values_must_be_ordered() {
    let rig = open_rig().await;
    let session = &rig.session;
    let inverted = SoftLimits { cw: Some(-10), ccw: Some(10) };
    assert!(matches!(session.set_soft_limit_values(4, inverted).await, Err(DeviceError::OutOfRange(_))));

    let limits = SoftLimits { cw: Some(9000), ccw: None };
    session.set_soft_limit_values(4, limits).await.unwrap();
    assert_eq!(session.get_soft_limits(4).await.unwrap(), limits);
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_commit_survives_restart() {
    let rig = open_rig().await;
    let session = &rig.session;

    session.set_jog_params(5, 250).await.unwrap();
    session.commit(5, PersistKind::JogParams).await.unwrap();
    session.set_home_info(5, HomeDirection::CounterClockwise).await.unwrap();
    assert!(session.is_dirty(5, PersistKind::Home).await.unwrap());

    session.restart_board().await.unwrap();
    assert_eq!(session.parameters(5).await.unwrap().jog_step, None);
    assert!(!session.is_dirty(5, PersistKind::Home).await.unwrap());

    assert_eq!(session.get_jog_params(5).await.unwrap(), 250);
    assert_eq!(session.get_home_info(5).await.unwrap(), HomeDirection::Clockwise);
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_commit_does_not_change_live_values() {
    let rig = open_rig().await;
    let session = &rig.session;

    session.set_jog_params(6, 300).await.unwrap();
    session.commit(6, PersistKind::SoftLimits).await.unwrap();
    assert_eq!(session.get_jog_params(6).await.unwrap(), 300);
    assert!(session.is_dirty(6, PersistKind::JogParams).await.unwrap());
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_slot_title_bounds() {
    let rig = open_rig().await;
    let session = &rig.session;

    session.set_slot_title(4, "X stage").await.unwrap();
    assert_eq!(session.get_slot_title(4).await.unwrap(), "X stage");

    let longest = "a".repeat(15);
    session.set_slot_title(4, &longest).await.unwrap();
    assert_eq!(session.get_slot_title(4).await.unwrap(), longest);

    assert!(matches!(session.set_slot_title(4, &"a".repeat(16)).await, Err(DeviceError::OutOfRange(_))));
    assert!(matches!(session.set_slot_title(4, "").await, Err(DeviceError::OutOfRange(_))));
    assert_eq!(session.get_slot_title(4).await.unwrap(), longest);
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_system_dim() {
    let rig = open_rig().await;
    let session = &rig.session;
    session.set_system_dim(80).await.unwrap();
    assert_eq!(session.get_system_dim().await.unwrap(), 80);
    assert!(matches!(session.set_system_dim(101).await, Err(DeviceError::OutOfRange(_))));
    assert_eq!(session.get_system_dim().await.unwrap(), 80);
    rig.manager.close_all().await;
}

#[tokio::test]
async fn test_erase_configuration_restores_defaults() {
    let rig = open_rig().await;
    let session = &rig.session;

    session.set_jog_params(4, 42).await.unwrap();
    session.commit(4, PersistKind::JogParams).await.unwrap();
    session.erase_configuration(4).await.unwrap();
    assert_eq!(session.parameters(4).await.unwrap().jog_step, None);
    assert_eq!(session.get_jog_params(4).await.unwrap(), 100);

    session.restart_board().await.unwrap();
    assert_eq!(session.get_jog_params(4).await.unwrap(), 100);
    rig.manager.close_all().await;
}
