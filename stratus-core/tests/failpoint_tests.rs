//! Fault injection at the crash windows of the orchestrator
//!
//! Each test fails one marked point and checks that the durable records
//! stay consistent and that recovery can finish the job.

#![cfg(all(feature = "test-helpers", feature = "failpoints"))]

use std::collections::BTreeMap;

use stratus_core::{
    error::ErrorKind,
    failpoints::{self, with_failpoint},
    orchestrator::MigrationRequest,
    state_machine::TransitionRequest,
    state_table::{Event, State},
    types::{PoolId, PowerState, VmId, VolumeId},
    work_ledger::Step,
};

mod common;
use common::{kinds, last_work, migration_env, DESTINATION, SOURCE, VM};

#[tokio::test]
async fn test_crash_before_complete_phase() {
    let scenario = fail::FailScenario::setup();
    failpoints::init();

    let env = migration_env(2);
    let mut map = BTreeMap::new();
    map.insert(VolumeId(100), PoolId(301));
    let before = env.store.load(VM).unwrap();

    let err = with_failpoint(
        "orchestrator::before_complete",
        "return",
        env.orchestrator
            .migrate(MigrationRequest::with_storage(VM, SOURCE, DESTINATION, map)),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RuntimeFault);
    assert_eq!(
        kinds(&env.fleet.operations()),
        vec![
            (6, "MigrateWithStorageReceiveCommand"),
            (5, "MigrateWithStorageSendCommand"),
        ]
    );
    assert_eq!(env.store.load(VM).unwrap(), before);
    assert_eq!(last_work(&env, VM).step, Step::Started);

    // The send went through: the VM now runs on the destination
    env.fleet.set_power_state(SOURCE, PowerState::PowerOff);
    env.fleet.set_power_state(DESTINATION, PowerState::PowerOn);
    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.resolved.len(), 1);

    let vm = env.store.load(VM).unwrap();
    assert_eq!(vm.host_id, Some(DESTINATION));
    assert_eq!(
        env.inventory.get_volume(VolumeId(100)).unwrap().unwrap().pool_id,
        PoolId(301)
    );

    scenario.teardown();
}

#[tokio::test]
async fn test_failed_cas_writes_nothing() {
    let scenario = fail::FailScenario::setup();
    failpoints::init();

    let env = migration_env(1);
    let before = env.store.load(VM).unwrap();

    fail::cfg("state_machine::before_cas", "return").unwrap();
    let result = env.engine.transition(
        TransitionRequest::new(VM, State::Running, Event::StopRequested)
            .at_version(before.update_count),
    );
    fail::cfg("state_machine::before_cas", "off").unwrap();

    assert_eq!(result.unwrap_err().kind(), ErrorKind::RuntimeFault);
    assert_eq!(env.store.load(VM).unwrap(), before);

    scenario.teardown();
}

#[tokio::test]
async fn test_failed_begin_work_dispatches_nothing() {
    let scenario = fail::FailScenario::setup();
    failpoints::init();

    let env = migration_env(1);

    let err = with_failpoint(
        "work_ledger::begin_work",
        "return",
        env.orchestrator.stop(VM, false),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RuntimeFault);
    assert!(env.fleet.dispatches().is_empty());
    assert!(env.ledger.list().unwrap().is_empty());
    assert_eq!(env.store.load(VM).unwrap().state, State::Running);

    // The lock taken before the failure was released
    env.orchestrator.stop(VM, false).await.unwrap();
    assert_eq!(env.store.load(VmId(1)).unwrap().state, State::Stopped);

    scenario.teardown();
}
