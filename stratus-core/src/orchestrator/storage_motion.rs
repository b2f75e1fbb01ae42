use futures::future::join;
use std::collections::HashMap;
use tracing::{error, info, warn};

use super::{Failure, Orchestrator};
use crate::{
    agent::{
        command::{
            MigrateWithStorageCleanupCommand, MigrateWithStorageCommand,
            MigrateWithStorageCompleteCommand, MigrateWithStorageReceiveCommand,
            MigrateWithStorageSendCommand, VolumePath, VolumeTarget,
        },
        send_typed,
    },
    error::{StratusError, StratusResult},
    fail_point,
    storage::VolumeMigration,
    types::{MigrationPlan, PowerState, VirtualMachineInstance},
};

impl Orchestrator {
    /// Source and destination share a storage fabric: one command to the
    /// destination host copies the volumes and cuts over.
    pub(crate) async fn migrate_within_cluster(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
        targets: Vec<VolumeTarget>,
    ) -> Result<VirtualMachineInstance, Failure> {
        let command = MigrateWithStorageCommand {
            vm_uuid: vm.uuid.clone(),
            source_host_id: plan.source_host_id,
            volumes: targets.clone(),
        };

        match send_typed(
            self.dispatcher.as_ref(),
            plan.destination_host_id,
            &command,
            self.waits.storage_migrate_wait,
        )
        .await
        {
            Ok(answer) => {
                let migrations = volume_migrations(vm, &targets, &answer.volumes);
                self.record_move(vm, plan, &migrations)
                    .map_err(Failure::Unresolved)
            }
            Err(e) if e.kind().is_ambiguous() => {
                warn!(
                    "Storage migration of VM {} to host {} has an unknown outcome: {}",
                    vm.id, plan.destination_host_id, e
                );
                self.locate_after_storage_migration(vm, plan, &targets, e).await
            }
            Err(e) => {
                warn!(
                    "Storage migration of VM {} to host {} failed: {}",
                    vm.id, plan.destination_host_id, e
                );
                Err(Failure::Failed(e))
            }
        }
    }

    /// Ask both hosts where the VM runs after a lost storage migration
    /// answer. A move is recorded with the planned pools and the old volume
    /// paths, since the host's paths were lost with the answer.
    async fn locate_after_storage_migration(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
        targets: &[VolumeTarget],
        original: StratusError,
    ) -> Result<VirtualMachineInstance, Failure> {
        let (source, destination) = join(
            self.probe(plan.source_host_id, &vm.uuid),
            self.probe(plan.destination_host_id, &vm.uuid),
        )
        .await;
        info!(
            "VM {} after storage migration: source host {} reports {:?}, destination host {} reports {:?}",
            vm.id, plan.source_host_id, source, plan.destination_host_id, destination
        );

        match (source, destination) {
            (Ok(PowerState::PowerOff), Ok(PowerState::PowerOn)) => {
                let migrations: Vec<VolumeMigration> = targets
                    .iter()
                    .map(|target| VolumeMigration {
                        volume_id: target.volume_id,
                        destination_pool: target.pool_id,
                        path: None,
                    })
                    .collect();
                self.record_move(vm, plan, &migrations)
                    .map_err(Failure::Unresolved)
            }
            (Ok(PowerState::PowerOn), _) => {
                warn!(
                    "VM {} still runs on source host {}, storage migration did not happen",
                    vm.id, plan.source_host_id
                );
                Err(Failure::Failed(original))
            }
            _ => Err(Failure::Unresolved(original)),
        }
    }

    /// Receive on the destination, send from the source, complete on the
    /// destination. Nothing is persisted until the complete phase succeeds.
    pub(crate) async fn migrate_across_clusters(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
        targets: Vec<VolumeTarget>,
    ) -> Result<VirtualMachineInstance, Failure> {
        let receive = MigrateWithStorageReceiveCommand {
            vm_uuid: vm.uuid.clone(),
            volumes: targets.clone(),
        };
        let received = send_typed(
            self.dispatcher.as_ref(),
            plan.destination_host_id,
            &receive,
            self.waits.storage_migrate_wait,
        )
        .await
        .map_err(|e| {
            warn!(
                "Receive phase for VM {} on host {} failed: {}",
                vm.id, plan.destination_host_id, e
            );
            Failure::Failed(e)
        })?;
        info!(
            "Host {} prepared to receive VM {} (token {})",
            plan.destination_host_id, vm.id, received.token
        );

        let send = MigrateWithStorageSendCommand {
            vm_uuid: vm.uuid.clone(),
            destination_host_id: plan.destination_host_id,
            token: received.token.clone(),
            volume_to_storage: received.volume_to_storage.clone(),
            nic_to_network: received.nic_to_network.clone(),
        };
        match send_typed(
            self.dispatcher.as_ref(),
            plan.source_host_id,
            &send,
            self.waits.storage_migrate_wait,
        )
        .await
        {
            Ok(()) => {}
            Err(e) if e.kind().is_ambiguous() => {
                return match self.probe(plan.source_host_id, &vm.uuid).await {
                    Ok(PowerState::PowerOn) => {
                        warn!(
                            "Send phase for VM {} ended ambiguously but the VM still runs on host {}",
                            vm.id, plan.source_host_id
                        );
                        self.cleanup_receive(vm, plan, &received.token).await;
                        Err(Failure::Failed(e))
                    }
                    probe => {
                        error!(
                            "Send phase for VM {} ended ambiguously, source host {} reports {:?}",
                            vm.id, plan.source_host_id, probe
                        );
                        Err(Failure::Unresolved(e))
                    }
                };
            }
            Err(e) => {
                warn!(
                    "Send phase for VM {} from host {} failed: {}",
                    vm.id, plan.source_host_id, e
                );
                self.cleanup_receive(vm, plan, &received.token).await;
                return Err(Failure::Failed(e));
            }
        }

        before_complete_phase().map_err(Failure::Unresolved)?;

        let complete = MigrateWithStorageCompleteCommand {
            vm_uuid: vm.uuid.clone(),
            volumes: targets.clone(),
        };
        match send_typed(
            self.dispatcher.as_ref(),
            plan.destination_host_id,
            &complete,
            self.waits.storage_migrate_wait,
        )
        .await
        {
            Ok(answer) => {
                let migrations = volume_migrations(vm, &targets, &answer.volumes);
                self.record_move(vm, plan, &migrations)
                    .map_err(Failure::Unresolved)
            }
            Err(e) => Err(Failure::Unresolved(self.split_state(vm, plan, e).await)),
        }
    }

    /// Compute may have moved while the record has not. Probe both hosts,
    /// log what they say and hand the VM to the recovery scan.
    async fn split_state(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
        cause: StratusError,
    ) -> StratusError {
        let (source, destination) = join(
            self.probe(plan.source_host_id, &vm.uuid),
            self.probe(plan.destination_host_id, &vm.uuid),
        )
        .await;
        error!(
            "Complete phase for VM {} failed ({}): source host {} reports {:?}, destination host {} reports {:?}",
            vm.id, cause, plan.source_host_id, source, plan.destination_host_id, destination
        );
        StratusError::ReconciliationRequired {
            vm_id: vm.id,
            details: format!(
                "complete phase failed ({}); source {:?}, destination {:?}",
                cause,
                source.ok(),
                destination.ok()
            ),
        }
    }

    async fn cleanup_receive(&self, vm: &VirtualMachineInstance, plan: &MigrationPlan, token: &str) {
        let cleanup = MigrateWithStorageCleanupCommand {
            vm_uuid: vm.uuid.clone(),
            token: token.to_string(),
        };
        match send_typed(
            self.dispatcher.as_ref(),
            plan.destination_host_id,
            &cleanup,
            self.command_wait,
        )
        .await
        {
            Ok(()) => info!(
                "Released receive placeholder for VM {} on host {}",
                vm.id, plan.destination_host_id
            ),
            Err(e) => warn!(
                "Unable to release receive placeholder for VM {} on host {}: {}",
                vm.id, plan.destination_host_id, e
            ),
        }
    }
}

fn before_complete_phase() -> StratusResult<()> {
    fail_point!("orchestrator::before_complete");
    Ok(())
}

/// Pair each migrated volume with the path the host reported for it.
fn volume_migrations(
    vm: &VirtualMachineInstance,
    targets: &[VolumeTarget],
    reported: &[VolumePath],
) -> Vec<VolumeMigration> {
    let paths: HashMap<_, _> = reported
        .iter()
        .map(|entry| (entry.volume_id, entry.path.clone()))
        .collect();

    targets
        .iter()
        .map(|target| {
            let path = paths.get(&target.volume_id).cloned();
            if path.is_none() {
                error!(
                    "Host answer for VM {} carries no path for volume {}",
                    vm.id, target.volume_id
                );
            }
            VolumeMigration {
                volume_id: target.volume_id,
                destination_pool: target.pool_id,
                path,
            }
        })
        .collect()
}
