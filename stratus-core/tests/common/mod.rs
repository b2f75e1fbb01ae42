// Shared fixtures for the orchestrator integration tests

#![allow(dead_code)]

use stratus_core::{
    config::StratusConfig,
    test_helpers::{host, pool, vm, volume, TestEnvironment},
    types::{HostId, VmId},
    work_ledger::WorkItem,
};

pub const SOURCE: HostId = HostId(5);
pub const DESTINATION: HostId = HostId(6);
pub const VM: VmId = VmId(1);

/// Hosts 5 and 6 with VM 1 running on host 5.
///
/// Host 5 sits in cluster 1; host 6 in `destination_cluster`. The VM owns
/// volume 100 on shared pool 200. Pools 201 (shared) and 202 (local) are in
/// cluster 1, pool 301 (shared) in cluster 2.
pub fn migration_env(destination_cluster: u64) -> TestEnvironment {
    migration_env_with(StratusConfig::test(), destination_cluster)
}

pub fn migration_env_with(config: StratusConfig, destination_cluster: u64) -> TestEnvironment {
    let env = TestEnvironment::with_config(config).unwrap();
    env.add_host(host(5, 1)).unwrap();
    env.add_host(host(6, destination_cluster)).unwrap();

    env.inventory.put_pool(&pool(200, 1, false)).unwrap();
    env.inventory.put_pool(&pool(201, 1, false)).unwrap();
    env.inventory.put_pool(&pool(202, 1, true)).unwrap();
    env.inventory.put_pool(&pool(301, 2, false)).unwrap();
    env.inventory.put_volume(&volume(100, 1, 200, false)).unwrap();

    env.add_vm(&vm(1)).unwrap();
    env.place_running(VM, SOURCE).unwrap();
    env
}

/// Most recent work item recorded for `vm_id`.
pub fn last_work(env: &TestEnvironment, vm_id: VmId) -> WorkItem {
    env.ledger
        .list()
        .unwrap()
        .into_iter()
        .filter(|item| item.vm_id == vm_id)
        .last()
        .expect("no work item recorded")
}

pub fn kinds(dispatches: &[(HostId, String)]) -> Vec<(u64, &str)> {
    dispatches
        .iter()
        .map(|(host_id, kind)| (host_id.0, kind.as_str()))
        .collect()
}
