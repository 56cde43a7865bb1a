//! Host lifecycle scenarios against the simulated lab.
//!
//! Every test runs on a paused tokio clock, so lock/unlock/reboot/swact
//! windows of minutes complete instantly while keeping their ordering.

mod common;

use common::controller_on;
use hostctl_common::mock::{MockConnector, MockPlatform, ScriptedShell};
use hostctl_common::{
    AdminState, AvailState, Credentials, Endpoint, HostError, HostState, HostStateController,
    HostTimeouts, LockOptions, OpCode, OperState, RebootOptions, Session, StateCriteria,
    SwactOptions, UnlockOptions, WaitOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn locked_online() -> HostState {
    HostState::new(AdminState::Locked, OperState::Disabled, AvailState::Online)
}

fn in_service() -> HostState {
    HostState::new(AdminState::Unlocked, OperState::Enabled, AvailState::Available)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn host_list_reports_every_host() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let records = controller.host_records().await.unwrap();
    let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["controller-0", "controller-1", "compute-0", "compute-1"]);
    assert!(records.iter().all(|r| r.state.is_in_service()));

    assert_eq!(controller.active_controller().await.unwrap(), "controller-0");
    assert_eq!(
        controller.standby_controller("controller-0").await.unwrap().as_deref(),
        Some("controller-1")
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_host_is_reported() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let err = controller.host_state("storage-9").await.unwrap_err();
    assert!(matches!(err, HostError::UnknownHost(ref h) if h == "storage-9"));

    let options = WaitOptions::new(Duration::from_secs(30));
    let err = controller
        .wait_for_states(&["storage-9"], &StateCriteria::in_service(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::UnknownHost(_)));
}

// ---------------------------------------------------------------------------
// Lock / unlock
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn lock_then_unlock_compute() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let locked = controller.lock("compute-0", LockOptions::default()).await.unwrap();
    assert_eq!(locked.code, OpCode::Success, "{locked}");
    assert_eq!(platform.state("compute-0").unwrap(), locked_online());

    let again = controller.lock("compute-0", LockOptions::default()).await.unwrap();
    assert_eq!(again.code, OpCode::AlreadyInState);
    assert_eq!(platform.command_count("system host-lock"), 1);

    let unlocked = controller.unlock("compute-0", UnlockOptions::default()).await.unwrap();
    assert_eq!(unlocked.code, OpCode::Success, "{unlocked}");
    assert!(unlocked.elapsed >= Duration::from_secs(180));
    assert_eq!(platform.state("compute-0").unwrap(), in_service());
}

#[tokio::test(start_paused = true)]
async fn lock_active_controller_swacts_first() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.lock("controller-0", LockOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Success, "{result}");
    assert_eq!(platform.active_controller(), "controller-1");
    assert_eq!(platform.state("controller-0").unwrap(), locked_online());
    assert_eq!(platform.command_count("system host-swact controller-0"), 1);
    assert!(controller.session().is_connected());
}

#[tokio::test(start_paused = true)]
async fn lock_active_controller_without_standby_is_rejected() {
    let platform = MockPlatform::simplex();
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.lock("controller-0", LockOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Rejected);
    assert_eq!(result.code.code(), 1);
    assert!(result.message.contains("Cannot lock an active controller"), "{}", result.message);
    assert_eq!(platform.state("controller-0").unwrap(), in_service());
    assert!(matches!(result.into_result(), Err(HostError::CommandRejected { .. })));
}

#[tokio::test(start_paused = true)]
async fn platform_rejection_is_returned_not_raised() {
    let platform = MockPlatform::standard();
    platform.reject_lock("compute-1", "Rejected: compute-1 hosts the only instance of a pinned VM");
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.lock("compute-1", LockOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Rejected);
    assert!(result.message.contains("pinned VM"));
    assert_eq!(platform.state("compute-1").unwrap(), in_service());
}

#[tokio::test(start_paused = true)]
async fn forced_lock_skips_online_check() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.lock("compute-1", LockOptions::forced()).await.unwrap();
    assert_eq!(result.code, OpCode::Success);
    assert_eq!(platform.command_count("system host-lock compute-1 --force"), 1);
    assert_eq!(
        platform.state("compute-1").unwrap().administrative,
        AdminState::Locked
    );
}

#[tokio::test(start_paused = true)]
async fn unlock_stuck_offline_times_out_with_observed_state() {
    let platform = MockPlatform::standard();
    platform.set_state("compute-0", locked_online());
    platform.set_stuck_offline("compute-0", true);
    let (mut controller, _) = controller_on(&platform).await;

    let options = UnlockOptions {
        timeout: Some(Duration::from_secs(300)),
        ..UnlockOptions::default()
    };
    let result = controller.unlock("compute-0", options).await.unwrap();
    assert_eq!(result.code, OpCode::StateTimeout);
    assert!(result.elapsed >= Duration::from_secs(300));
    match result.cause() {
        Some(HostError::StateTimeout { hosts, observed, .. }) => {
            assert_eq!(hosts, &["compute-0".to_string()]);
            let state = observed[0].1.unwrap();
            assert_eq!(state.availability, AvailState::Offline);
        }
        other => panic!("unexpected cause {other:?}"),
    }
    assert!(result.message.contains("unlocked/disabled/offline"));
}

#[tokio::test(start_paused = true)]
async fn unlock_without_waiting_is_dispatched() {
    let platform = MockPlatform::standard();
    platform.set_state("compute-1", locked_online());
    let (mut controller, _) = controller_on(&platform).await;

    let options = UnlockOptions {
        wait_for_available: false,
        ..UnlockOptions::default()
    };
    let result = controller.unlock("compute-1", options).await.unwrap();
    assert_eq!(result.code, OpCode::Dispatched);
    assert!(result.is_success());
    assert_eq!(
        platform.state("compute-1").unwrap().administrative,
        AdminState::Unlocked
    );
}

#[tokio::test(start_paused = true)]
async fn unlocked_but_offline_host_is_not_already_in_state() {
    let platform = MockPlatform::standard();
    platform.set_state(
        "compute-0",
        HostState::new(AdminState::Unlocked, OperState::Disabled, AvailState::Offline),
    );
    platform.set_stuck_offline("compute-0", true);
    let (mut controller, _) = controller_on(&platform).await;

    let options = UnlockOptions {
        timeout: Some(Duration::from_secs(300)),
        ..UnlockOptions::default()
    };
    let result = controller.unlock("compute-0", options).await.unwrap();
    assert_eq!(result.code, OpCode::StateTimeout, "{result}");
    assert!(!result.is_success());
    assert!(result.elapsed >= Duration::from_secs(300));
    assert_eq!(platform.command_count("system host-unlock"), 0);
}

#[tokio::test(start_paused = true)]
async fn unlock_of_rebooting_host_waits_for_it_to_return() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let reboot = RebootOptions {
        wait_for_finish: false,
        ..RebootOptions::default()
    };
    let dispatched = controller.reboot("compute-1", reboot).await.unwrap();
    assert_eq!(dispatched.code, OpCode::Dispatched);

    let result = controller.unlock("compute-1", UnlockOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::AlreadyInState, "{result}");
    assert!(result.elapsed >= Duration::from_secs(150));
    assert_eq!(platform.state("compute-1").unwrap(), in_service());
    assert_eq!(platform.command_count("system host-unlock"), 0);
}

#[tokio::test(start_paused = true)]
async fn unlock_waits_for_task_to_clear() {
    let platform = MockPlatform::standard();
    platform.set_state("compute-0", locked_online());
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.unlock("compute-0", UnlockOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Success, "{result}");
    assert!(result.elapsed >= Duration::from_secs(190));
    assert!(platform.host("compute-0").unwrap().task.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unlock_with_task_that_never_clears_fails_post_check() {
    let platform = MockPlatform::standard();
    platform.set_state("compute-0", locked_online());
    platform.set_stuck_task("compute-0", true);
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.unlock("compute-0", UnlockOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::PostCheckFailed, "{result}");
    assert_eq!(result.code.code(), 3);
    assert!(result.message.contains("Enabling"), "{}", result.message);
    assert_eq!(platform.state("compute-0").unwrap(), in_service());

    platform.set_state("compute-1", locked_online());
    platform.set_stuck_task("compute-1", true);
    let options = UnlockOptions {
        wait_for_task_clear: false,
        ..UnlockOptions::default()
    };
    let result = controller.unlock("compute-1", options).await.unwrap();
    assert_eq!(result.code, OpCode::Success, "{result}");
}

// ---------------------------------------------------------------------------
// Reboot / swact
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reboot_unlocked_compute_comes_back_in_service() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.reboot("compute-1", RebootOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Success, "{result}");
    assert!(result.elapsed >= Duration::from_secs(150));
    assert_eq!(platform.state("compute-1").unwrap(), in_service());
}

#[tokio::test(start_paused = true)]
async fn reboot_locked_host_comes_back_online() {
    let platform = MockPlatform::standard();
    platform.set_state("compute-0", locked_online());
    let (mut controller, _) = controller_on(&platform).await;

    let result = controller.reboot("compute-0", RebootOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Success, "{result}");
    assert_eq!(platform.state("compute-0").unwrap(), locked_online());
}

#[tokio::test(start_paused = true)]
async fn reboot_that_never_returns_times_out() {
    let platform = MockPlatform::standard();
    platform.set_stuck_offline("compute-1", true);
    let (mut controller, _) = controller_on(&platform).await;

    let options = RebootOptions {
        timeout: Some(Duration::from_secs(600)),
        ..RebootOptions::default()
    };
    let result = controller.reboot("compute-1", options).await.unwrap();
    assert_eq!(result.code, OpCode::StateTimeout);
}

#[tokio::test(start_paused = true)]
async fn swact_moves_session_to_new_active() {
    let platform = MockPlatform::standard();
    let (mut controller, connector) = controller_on(&platform).await;

    let result = controller.swact(SwactOptions::default()).await.unwrap();
    assert_eq!(result.code, OpCode::Success, "{result}");
    assert_eq!(result.host.as_deref(), Some("controller-1"));
    assert!(result.elapsed >= Duration::from_secs(30));
    assert!(connector.open_count() >= 2);
    assert_eq!(controller.active_controller().await.unwrap(), "controller-1");
}

#[tokio::test(start_paused = true)]
async fn swact_without_takeover_fails_post_check() {
    let platform = MockPlatform::standard();
    platform.set_swact_takeover_fails(true);
    let (mut controller, _) = controller_on(&platform).await;

    let options = SwactOptions {
        timeout: Some(Duration::from_secs(180)),
        ..SwactOptions::default()
    };
    let result = controller.swact(options).await.unwrap();
    assert_eq!(result.code, OpCode::PostCheckFailed);
    assert_eq!(result.code.code(), 3);
    assert!(matches!(result.into_result(), Err(HostError::PostCheckFailed { .. })));
}

// ---------------------------------------------------------------------------
// wait_for_states
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn wait_fail_ok_returns_last_observed_states() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let locked = StateCriteria::new().administrative(AdminState::Locked);
    let options = WaitOptions::new(Duration::from_secs(30)).fail_ok(true);
    let outcome = controller
        .wait_for_states(&["compute-0", "compute-1"], &locked, &options)
        .await
        .unwrap();
    assert!(!outcome.satisfied);
    assert_eq!(outcome.states.len(), 2);
    assert_eq!(outcome.states["compute-0"], Some(in_service()));
}

#[tokio::test(start_paused = true)]
async fn wait_survives_failed_polls() {
    let platform = MockPlatform::standard();
    platform.fail_next_host_lists(3);
    let (mut controller, _) = controller_on(&platform).await;

    let options = WaitOptions::new(Duration::from_secs(60));
    let outcome = controller
        .wait_for_states(&["compute-0"], &StateCriteria::in_service(), &options)
        .await
        .unwrap();
    assert!(outcome.satisfied);
    assert!(outcome.elapsed >= Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn wait_reconnects_after_dropped_session() {
    let platform = MockPlatform::standard();
    let (mut controller, connector) = controller_on(&platform).await;
    connector.sever_all();

    let options = WaitOptions::new(Duration::from_secs(60));
    let outcome = controller
        .wait_for_states(&["compute-1"], &StateCriteria::in_service(), &options)
        .await
        .unwrap();
    assert!(outcome.satisfied);
    assert_eq!(connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn hung_host_list_does_not_stretch_the_wait() {
    let shell = ScriptedShell::new("controller-0:~$ ")
        .with_command("hostname", "controller-0", 0)
        .with_hang("system host-list");
    let session = Session::open(
        Endpoint::mock("lab"),
        Credentials::default(),
        common::INITIAL_PROMPT,
        Arc::new(MockConnector::scripted(shell)),
        Default::default(),
    )
    .await
    .unwrap();
    let mut controller = HostStateController::new(session, HostTimeouts::default());

    let started = Instant::now();
    let options = WaitOptions::new(Duration::from_secs(5)).fail_ok(true);
    let outcome = controller
        .wait_for_states(&["compute-0"], &StateCriteria::in_service(), &options)
        .await
        .unwrap();
    assert!(!outcome.satisfied);
    assert!(started.elapsed() < Duration::from_secs(8), "{:?}", started.elapsed());

    let options = WaitOptions::new(Duration::from_secs(5));
    let err = controller
        .wait_for_states(&["compute-0"], &StateCriteria::in_service(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::StateTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(16), "{:?}", started.elapsed());
}

#[tokio::test(start_paused = true)]
async fn wait_requires_states_to_hold() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let options = WaitOptions::new(Duration::from_secs(120)).stable_for(Duration::from_secs(20));
    let outcome = controller
        .wait_for_states(&["compute-0"], &StateCriteria::in_service(), &options)
        .await
        .unwrap();
    assert!(outcome.satisfied);
    assert!(outcome.elapsed >= Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn wait_is_cancellable() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let cancel = controller.cancel_signal().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        cancel.cancel();
    });

    let never = StateCriteria::new().availability(AvailState::Failed);
    let options = WaitOptions::new(Duration::from_secs(600));
    let err = controller
        .wait_for_states(&["compute-0"], &never, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn wait_rejects_empty_host_list() {
    let platform = MockPlatform::standard();
    let (mut controller, _) = controller_on(&platform).await;

    let none: [&str; 0] = [];
    let err = controller
        .wait_for_states(&none, &StateCriteria::in_service(), &WaitOptions::new(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::InvalidArgument(_)));
}
