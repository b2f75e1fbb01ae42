// Scale-up through the placement retry loop

use stratus_core::{
    agent::command::{MigrateCommand, ScaleVmCommand},
    config::StratusConfig,
    error::ErrorKind,
    placement::ResourceAccounting,
    test_helpers::{host, vm, TestEnvironment},
    types::{AccountId, ComputeResources, HostId, PowerState, VmId},
    work_ledger::{OperationType, Step},
};

mod common;
use common::{kinds, last_work};

const VM: VmId = VmId(1);

fn scalable_env(config: StratusConfig) -> TestEnvironment {
    let env = TestEnvironment::with_config(config).unwrap();
    for id in [5, 6, 7] {
        env.add_host(host(id, 1)).unwrap();
    }
    let mut record = vm(1);
    record.dynamically_scalable = true;
    env.add_vm(&record).unwrap();
    env.place_running(VM, HostId(5)).unwrap();
    env
}

fn bigger() -> ComputeResources {
    ComputeResources::new(4, 4096)
}

#[tokio::test]
async fn test_scale_in_place() {
    let env = scalable_env(StratusConfig::test());

    let scaled = env.orchestrator.scale(VM, bigger()).await.unwrap();

    assert_eq!(scaled.resources, bigger());
    assert_eq!(scaled.host_id, Some(HostId(5)));
    assert_eq!(kinds(&env.fleet.operations()), vec![(5, "ScaleVmCommand")]);
    assert!(env.planner.calls().is_empty());
    assert_eq!(
        env.accounting.usage(AccountId(1)).await.unwrap(),
        ComputeResources::new(2, 2048)
    );

    let work = last_work(&env, VM);
    assert_eq!(work.operation, OperationType::Scale);
    assert_eq!(work.step, Step::Done);
}

#[tokio::test]
async fn test_scale_retries_until_a_host_takes_it() {
    let mut config = StratusConfig::test();
    config.placement.max_retries = 3;
    let env = scalable_env(config);
    env.capacity.deny(HostId(5));
    env.planner.set_candidates(vec![HostId(6), HostId(7)]);
    // First migration, towards host 6, is refused by the source
    env.fleet.fail::<MigrateCommand>(HostId(5), "destination unreachable");

    let scaled = env.orchestrator.scale(VM, bigger()).await.unwrap();

    assert_eq!(scaled.host_id, Some(HostId(7)));
    assert_eq!(scaled.resources, bigger());
    assert_eq!(
        kinds(&env.fleet.operations()),
        vec![
            (5, "MigrateCommand"),
            (5, "MigrateCommand"),
            (7, "ScaleVmCommand"),
        ]
    );

    // Tried-and-failed hosts only: 5 lacked capacity, 6 failed the move
    let calls = env.planner.calls();
    assert_eq!(calls.len(), 2);
    let first: Vec<_> = calls[0].hosts().collect();
    assert_eq!(first, vec![HostId(5)]);
    let excluded: Vec<_> = calls[1].hosts().collect();
    assert_eq!(excluded, vec![HostId(5), HostId(6)]);

    // Speculative increments of failed attempts were reverted
    assert_eq!(
        env.accounting.usage(AccountId(1)).await.unwrap(),
        ComputeResources::new(2, 2048)
    );
}

#[tokio::test]
async fn test_full_current_host_falls_through_to_planner_in_one_attempt() {
    let mut config = StratusConfig::test();
    config.placement.max_retries = 1;
    let env = scalable_env(config);
    env.capacity.deny(HostId(5));
    env.planner.set_candidates(vec![HostId(6)]);

    let scaled = env.orchestrator.scale(VM, bigger()).await.unwrap();

    assert_eq!(scaled.host_id, Some(HostId(6)));
    assert_eq!(scaled.resources, bigger());
    assert_eq!(env.planner.calls().len(), 1);
    assert_eq!(
        kinds(&env.fleet.operations()),
        vec![(5, "MigrateCommand"), (6, "ScaleVmCommand")]
    );
    assert_eq!(
        env.accounting.usage(AccountId(1)).await.unwrap(),
        ComputeResources::new(2, 2048)
    );
    assert_eq!(last_work(&env, VM).step, Step::Done);
}

#[tokio::test]
async fn test_lost_scale_migration_recovered_onto_destination() {
    let env = scalable_env(StratusConfig::test());
    env.capacity.deny(HostId(5));
    env.planner.set_candidates(vec![HostId(6)]);
    env.fleet.time_out::<MigrateCommand>(HostId(5));

    let err = env.orchestrator.scale(VM, bigger()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RuntimeFault);
    let work = last_work(&env, VM);
    assert_eq!(work.step, Step::Started);
    let plan = work.plan.expect("scale work records its migration");
    assert_eq!(
        (plan.source_host_id, plan.destination_host_id),
        (HostId(5), HostId(6))
    );

    // The move went through before the answer was lost
    env.fleet.set_power_state(HostId(5), PowerState::PowerOff);
    env.fleet.set_power_state(HostId(6), PowerState::PowerOn);
    let report = env.recovery_scanner().scan().await.unwrap();
    assert_eq!(report.resolved.len(), 1);

    let vm = env.store.load(VM).unwrap();
    assert_eq!(vm.host_id, Some(HostId(6)));
    assert_eq!(vm.last_host_id, Some(HostId(5)));
    assert_eq!(vm.resources, ComputeResources::new(2, 2048));
    assert_eq!(last_work(&env, VM).step, Step::Done);
    assert_eq!(
        env.accounting.usage(AccountId(1)).await.unwrap(),
        ComputeResources::default()
    );
}

#[tokio::test]
async fn test_scale_exhausted_reverts_accounting() {
    let env = scalable_env(StratusConfig::test());
    env.capacity.deny(HostId(5));
    env.planner.set_candidates(vec![HostId(6)]);
    env.fleet.fail::<MigrateCommand>(HostId(5), "destination unreachable");

    let err = env.orchestrator.scale(VM, bigger()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(env.fleet.count_of::<ScaleVmCommand>(), 0);
    assert_eq!(
        env.accounting.usage(AccountId(1)).await.unwrap(),
        ComputeResources::default()
    );
    let vm = env.store.load(VM).unwrap();
    assert_eq!(vm.host_id, Some(HostId(5)));
    assert_eq!(vm.resources, ComputeResources::new(2, 2048));
    assert_eq!(last_work(&env, VM).step, Step::Error);
}

#[tokio::test]
async fn test_scale_requires_dynamic_scaling() {
    let env = TestEnvironment::new().unwrap();
    env.add_host(host(5, 1)).unwrap();
    env.add_vm(&vm(1)).unwrap();
    env.place_running(VM, HostId(5)).unwrap();

    let err = env.orchestrator.scale(VM, bigger()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert!(env.fleet.dispatches().is_empty());
    assert_eq!(
        env.accounting.usage(AccountId(1)).await.unwrap(),
        ComputeResources::default()
    );
    assert_eq!(last_work(&env, VM).step, Step::Cancelled);
}

#[tokio::test]
async fn test_scale_down_rejected() {
    let env = scalable_env(StratusConfig::test());

    let err = env
        .orchestrator
        .scale(VM, ComputeResources::new(1, 4096))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert!(env.fleet.dispatches().is_empty());
}

#[tokio::test]
async fn test_scale_stopped_vm_rejected() {
    let env = TestEnvironment::new().unwrap();
    let mut record = vm(1);
    record.dynamically_scalable = true;
    env.add_vm(&record).unwrap();

    let err = env.orchestrator.scale(VM, bigger()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}
