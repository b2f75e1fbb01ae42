// Crash recovery: unfinished work resolved once, across restarts

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use stratus_core::{
    agent::command::MigrateCommand,
    config::StratusConfig,
    orchestrator::MigrationRequest,
    state_machine::TransitionRequest,
    state_table::{Event, State},
    storage::{open_database, open_existing_database},
    test_helpers::{host, pool, vm, TestEnvironment},
    types::{HostId, MigrationPlan, NodeId, PoolId, PowerState, VmId, VolumeId},
    work_ledger::{OperationType, Step, WorkLedger},
};

mod common;
use common::{last_work, migration_env};

const SOURCE: HostId = HostId(5);
const DESTINATION: HostId = HostId(6);

fn with_hosts(env: &TestEnvironment) {
    env.add_host(host(5, 1)).unwrap();
    env.add_host(host(6, 1)).unwrap();
}

#[tokio::test]
async fn test_interrupted_migration_resolved_once_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stratus.redb");
    let vm_id = VmId(9);

    // First process: the migrate dispatch never comes back
    {
        let env =
            TestEnvironment::with_database(open_database(&path).unwrap(), StratusConfig::test())
                .unwrap();
        with_hosts(&env);
        env.add_vm(&vm(9)).unwrap();
        env.place_running(vm_id, SOURCE).unwrap();
        env.fleet.time_out::<MigrateCommand>(SOURCE);

        let err = env
            .orchestrator
            .migrate(MigrationRequest::compute(vm_id, SOURCE, DESTINATION))
            .await
            .unwrap_err();
        assert!(err.kind().is_ambiguous());
        assert_eq!(last_work(&env, vm_id).step, Step::Started);
    }

    // Second process on the same file: the VM turned up on the destination
    let env = TestEnvironment::with_database(
        open_existing_database(&path).unwrap(),
        StratusConfig::test(),
    )
    .unwrap();
    with_hosts(&env);
    env.fleet.set_power_state(SOURCE, PowerState::PowerOff);
    env.fleet.set_power_state(DESTINATION, PowerState::PowerOn);
    let before = env.store.load(vm_id).unwrap();
    assert_eq!(before.host_id, Some(SOURCE));

    let scanner = env.recovery_scanner();
    let first = scanner.scan().await.unwrap();
    assert_eq!(first.resolved.len(), 1);
    assert!(first.deferred.is_empty());

    let second = scanner.scan().await.unwrap();
    assert!(second.resolved.is_empty());

    let vm = env.store.load(vm_id).unwrap();
    assert_eq!(vm.state, State::Running);
    assert_eq!(vm.host_id, Some(DESTINATION));
    assert_eq!(vm.last_host_id, Some(SOURCE));
    assert_eq!(vm.update_count, before.update_count + 1);
    assert_eq!(last_work(&env, vm_id).step, Step::Done);
}

#[tokio::test]
async fn test_concurrent_scans_resolve_once() {
    let env = TestEnvironment::new().unwrap();
    with_hosts(&env);
    env.add_vm(&vm(3)).unwrap();
    env.engine
        .transition(
            TransitionRequest::new(VmId(3), State::Stopped, Event::StartRequested)
                .on_host(SOURCE),
        )
        .unwrap();
    let handle = env
        .ledger
        .begin_work(VmId(3), OperationType::Start, None)
        .await
        .unwrap();
    env.ledger.abandon(handle);
    env.fleet.set_power_state(SOURCE, PowerState::PowerOn);

    let a = Arc::new(env.recovery_scanner());
    let b = Arc::new(env.recovery_scanner());
    let (first, second) = tokio::join!(a.scan(), b.scan());

    let resolved = first.unwrap().resolved.len() + second.unwrap().resolved.len();
    assert_eq!(resolved, 1);
    assert_eq!(env.store.load(VmId(3)).unwrap().state, State::Running);
}

#[tokio::test]
async fn test_unknown_power_state_defers() {
    let env = TestEnvironment::new().unwrap();
    with_hosts(&env);
    env.add_vm(&vm(3)).unwrap();
    env.place_running(VmId(3), SOURCE).unwrap();
    env.engine
        .transition(TransitionRequest::new(
            VmId(3),
            State::Running,
            Event::StopRequested,
        ))
        .unwrap();
    let handle = env
        .ledger
        .begin_work(VmId(3), OperationType::Stop, None)
        .await
        .unwrap();
    env.ledger.abandon(handle);

    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(env.store.load(VmId(3)).unwrap().state, State::Stopping);
    assert_eq!(last_work(&env, VmId(3)).step, Step::Started);

    env.fleet.set_power_state(SOURCE, PowerState::PowerOn);
    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.resolved.len(), 1);
    assert_eq!(env.store.load(VmId(3)).unwrap().state, State::Running);
}

#[tokio::test]
async fn test_migration_found_on_neither_host_marks_stopped() {
    let env = TestEnvironment::new().unwrap();
    with_hosts(&env);
    env.add_vm(&vm(4)).unwrap();
    env.place_running(VmId(4), SOURCE).unwrap();
    env.fleet.time_out::<MigrateCommand>(SOURCE);
    env.orchestrator
        .migrate(MigrationRequest::compute(VmId(4), SOURCE, DESTINATION))
        .await
        .unwrap_err();

    env.fleet.set_power_state(SOURCE, PowerState::PowerOff);
    env.fleet.set_power_state(DESTINATION, PowerState::PowerOff);
    let report = env.recovery_scanner().scan().await.unwrap();

    assert_eq!(report.resolved.len(), 1);
    let vm = env.store.load(VmId(4)).unwrap();
    assert_eq!(vm.state, State::Stopped);
    assert_eq!(vm.host_id, None);
}

#[tokio::test]
async fn test_other_nodes_work_is_ignored() {
    let env = TestEnvironment::new().unwrap();
    with_hosts(&env);
    env.add_vm(&vm(3)).unwrap();

    let other = WorkLedger::new(env.database.clone(), NodeId(2), Duration::from_millis(100));
    let handle = other
        .begin_work(VmId(3), OperationType::Start, None)
        .await
        .unwrap();
    other.abandon(handle);

    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(last_work(&env, VmId(3)).step, Step::Started);
}

#[tokio::test]
async fn test_work_for_missing_vm_is_closed_as_error() {
    let env = TestEnvironment::new().unwrap();
    let handle = env
        .ledger
        .begin_work(VmId(77), OperationType::Stop, None)
        .await
        .unwrap();
    let id = handle.id();
    env.ledger.abandon(handle);

    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.failed, vec![id]);
    assert_eq!(env.ledger.get(id).unwrap().unwrap().step, Step::Error);
}

#[tokio::test]
async fn test_periodic_scanner_picks_up_work() {
    let env = TestEnvironment::new().unwrap();
    with_hosts(&env);
    env.add_vm(&vm(3)).unwrap();
    env.engine
        .transition(
            TransitionRequest::new(VmId(3), State::Stopped, Event::StartRequested)
                .on_host(SOURCE),
        )
        .unwrap();
    let handle = env
        .ledger
        .begin_work(VmId(3), OperationType::Start, None)
        .await
        .unwrap();
    env.ledger.abandon(handle);
    env.fleet.set_power_state(SOURCE, PowerState::PowerOff);

    let task = Arc::new(env.recovery_scanner()).spawn(env.config.recovery.scan_interval);
    let mut settled = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if last_work(&env, VmId(3)).step == Step::Done {
            settled = true;
            break;
        }
    }
    task.abort();

    assert!(settled, "periodic scan never closed the work item");
    assert_eq!(env.store.load(VmId(3)).unwrap().state, State::Stopped);
}

#[tokio::test]
async fn test_volume_write_failure_keeps_vm_on_source_until_retried() {
    let env = migration_env(1);
    let vm_id = VmId(1);
    let mut volume_to_pool = BTreeMap::new();
    volume_to_pool.insert(VolumeId(100), PoolId(999));
    let plan = MigrationPlan {
        vm_id,
        source_host_id: SOURCE,
        destination_host_id: DESTINATION,
        volume_to_pool,
        cross_cluster: false,
    };
    let handle = env
        .ledger
        .begin_work(vm_id, OperationType::MigrateWithStorage, Some(plan))
        .await
        .unwrap();
    env.ledger.abandon(handle);
    env.fleet.set_power_state(SOURCE, PowerState::PowerOff);
    env.fleet.set_power_state(DESTINATION, PowerState::PowerOn);

    // Pool 999 is not in the inventory yet, so the volume write fails
    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.deferred.len(), 1);
    assert_eq!(env.store.load(vm_id).unwrap().host_id, Some(SOURCE));
    assert_eq!(last_work(&env, vm_id).step, Step::Started);

    env.inventory.put_pool(&pool(999, 1, false)).unwrap();
    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.resolved.len(), 1);

    assert_eq!(env.store.load(vm_id).unwrap().host_id, Some(DESTINATION));
    let volume = env.inventory.get_volume(VolumeId(100)).unwrap().unwrap();
    assert_eq!(volume.pool_id, PoolId(999));
    assert_eq!(volume.last_pool_id, Some(PoolId(200)));
    assert_eq!(last_work(&env, vm_id).step, Step::Done);
}

#[tokio::test]
async fn test_start_respects_recovery_switch() {
    let env = TestEnvironment::new().unwrap();

    let mut config = env.config.recovery.clone();
    config.enabled = false;
    assert!(Arc::new(env.recovery_scanner()).start(&config).is_none());

    config.enabled = true;
    let task = Arc::new(env.recovery_scanner()).start(&config).unwrap();
    assert!(!task.is_finished());
    task.abort();
}
