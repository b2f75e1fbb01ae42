use std::collections::BTreeMap;
use tracing::{error, info, warn};

use super::{require_state, Failure, Orchestrator};
use crate::{
    agent::{
        command::{MigrateCommand, VolumeTarget},
        send_typed,
    },
    error::{StratusError, StratusResult},
    state_machine::TransitionRequest,
    state_table::{Event, State},
    storage::VolumeMigration,
    types::{HostId, MigrationPlan, PoolId, PoolScope, PowerState, VirtualMachineInstance, VmId, VolumeId},
    work_ledger::OperationType,
};

/// Caller input for a live migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub vm_id: VmId,
    pub source_host_id: HostId,
    pub destination_host_id: HostId,
    /// Empty for compute-only migration
    pub volume_to_pool: BTreeMap<VolumeId, PoolId>,
}

impl MigrationRequest {
    pub fn compute(vm_id: VmId, source_host_id: HostId, destination_host_id: HostId) -> Self {
        Self {
            vm_id,
            source_host_id,
            destination_host_id,
            volume_to_pool: BTreeMap::new(),
        }
    }

    pub fn with_storage(
        vm_id: VmId,
        source_host_id: HostId,
        destination_host_id: HostId,
        volume_to_pool: BTreeMap<VolumeId, PoolId>,
    ) -> Self {
        Self {
            vm_id,
            source_host_id,
            destination_host_id,
            volume_to_pool,
        }
    }
}

/// Where the VM ended up after an ambiguous compute migration
enum Landing {
    Moved,
    NotMoved(StratusError),
    Unknown(StratusError),
}

impl Orchestrator {
    /// Live-migrate a running VM, moving its volumes too when the request
    /// maps any.
    pub async fn migrate(&self, request: MigrationRequest) -> StratusResult<VirtualMachineInstance> {
        let plan = self.plan_migration(&request)?;
        let operation = if plan.moves_storage() {
            OperationType::MigrateWithStorage
        } else {
            OperationType::Migrate
        };

        let handle = self
            .ledger
            .begin_work(request.vm_id, operation, Some(plan.clone()))
            .await?;
        let result = self.migrate_with_work(&plan).await;
        self.settle(handle, result)
    }

    async fn migrate_with_work(
        &self,
        plan: &MigrationPlan,
    ) -> Result<VirtualMachineInstance, Failure> {
        let (vm, targets) = self
            .check_migration_preconditions(plan)
            .await
            .map_err(Failure::Rejected)?;

        info!(
            "Migrating VM {} from host {} to host {} ({} volume(s), cross cluster: {})",
            plan.vm_id,
            plan.source_host_id,
            plan.destination_host_id,
            targets.len(),
            plan.cross_cluster
        );

        if !plan.moves_storage() {
            self.migrate_compute(&vm, plan).await
        } else if plan.cross_cluster {
            self.migrate_across_clusters(&vm, plan, targets).await
        } else {
            self.migrate_within_cluster(&vm, plan, targets).await
        }
    }

    pub(crate) fn plan_migration(&self, request: &MigrationRequest) -> StratusResult<MigrationPlan> {
        let source = self.inventory.load_host(request.source_host_id)?;
        let destination = self.inventory.load_host(request.destination_host_id)?;
        Ok(MigrationPlan {
            vm_id: request.vm_id,
            source_host_id: source.id,
            destination_host_id: destination.id,
            volume_to_pool: request.volume_to_pool.clone(),
            cross_cluster: source.cluster_id != destination.cluster_id,
        })
    }

    /// Everything that can be checked locally before the first dispatch.
    /// Returns the VM and the destination of every mapped volume.
    pub(crate) async fn check_migration_preconditions(
        &self,
        plan: &MigrationPlan,
    ) -> StratusResult<(VirtualMachineInstance, Vec<VolumeTarget>)> {
        let vm = self.store().load(plan.vm_id)?;
        require_state(vm.id, "migrate", vm.state, &[State::Running])?;
        if vm.host_id != Some(plan.source_host_id) {
            return Err(StratusError::conflict(
                vm.id,
                format!(
                    "VM runs on host {:?}, not on source host {}",
                    vm.host_id, plan.source_host_id
                ),
            ));
        }
        if plan.source_host_id == plan.destination_host_id {
            return Err(StratusError::resource_unavailable(
                "host",
                format!("VM {} already runs on host {}", vm.id, plan.destination_host_id),
            ));
        }
        if self.snapshots.has_pending_snapshot(vm.id).await? {
            return Err(StratusError::resource_unavailable(
                "vm snapshot",
                format!("VM {} has a pending snapshot task", vm.id),
            ));
        }

        let destination = self.inventory.load_host(plan.destination_host_id)?;
        let mut targets = Vec::new();
        for volume in self.inventory.volumes_for_vm(vm.id)? {
            match plan.volume_to_pool.get(&volume.id) {
                Some(pool_id) => {
                    let pool = self.inventory.load_pool(*pool_id)?;
                    if volume.use_local_storage != pool.is_local() {
                        return Err(StratusError::resource_unavailable(
                            "storage pool",
                            format!(
                                "volume {} needs {} storage but pool {} is {}",
                                volume.id,
                                if volume.use_local_storage { "local" } else { "shared" },
                                pool.id,
                                if pool.is_local() { "local" } else { "shared" }
                            ),
                        ));
                    }
                    if pool.scope != PoolScope::Zone && pool.cluster_id != Some(destination.cluster_id) {
                        return Err(StratusError::resource_unavailable(
                            "storage pool",
                            format!(
                                "pool {} is not reachable from host {}",
                                pool.id, destination.id
                            ),
                        ));
                    }
                    targets.push(VolumeTarget {
                        volume_id: volume.id,
                        volume_path: volume.path.clone(),
                        pool_id: pool.id,
                        pool_path: pool.path.clone(),
                    });
                }
                None => {
                    let pool = self.inventory.load_pool(volume.pool_id)?;
                    if pool.is_local() {
                        return Err(StratusError::resource_unavailable(
                            "storage pool",
                            format!(
                                "volume {} sits on local pool {} and is not being migrated",
                                volume.id, pool.id
                            ),
                        ));
                    }
                }
            }
        }
        if targets.len() != plan.volume_to_pool.len() {
            return Err(StratusError::runtime_fault(format!(
                "volume map names volumes not attached to VM {}",
                vm.id
            )));
        }

        if !self.dispatcher.is_connected(destination.id) {
            return Err(StratusError::resource_unavailable(
                "host",
                format!("host {} is not reachable", destination.id),
            ));
        }
        if !destination.is_schedulable() {
            return Err(StratusError::resource_unavailable(
                "host",
                format!(
                    "host {} is {:?} (enabled: {})",
                    destination.id, destination.status, destination.enabled
                ),
            ));
        }
        if !destination.capabilities.contains(&vm.hypervisor) {
            return Err(StratusError::resource_unavailable(
                "host",
                format!("host {} does not run {} guests", destination.id, vm.hypervisor),
            ));
        }
        let guests = self.store().count_on_host(destination.id)?;
        if guests >= destination.max_guests as usize {
            return Err(StratusError::resource_unavailable(
                "host",
                format!(
                    "host {} is at its guest limit ({}/{})",
                    destination.id, guests, destination.max_guests
                ),
            ));
        }

        Ok((vm, targets))
    }

    /// Single migrate command to the source host.
    pub(crate) async fn migrate_compute(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
    ) -> Result<VirtualMachineInstance, Failure> {
        let command = MigrateCommand {
            vm_uuid: vm.uuid.clone(),
            destination_host_id: plan.destination_host_id,
        };
        let landing = match send_typed(
            self.dispatcher.as_ref(),
            plan.source_host_id,
            &command,
            self.waits.migrate_wait,
        )
        .await
        {
            Ok(()) => Landing::Moved,
            Err(e) if e.kind().is_ambiguous() => self.locate_after_migration(vm, plan, e).await,
            Err(e) => Landing::NotMoved(e),
        };

        match landing {
            Landing::Moved => self.record_move(vm, plan, &[]).map_err(Failure::Unresolved),
            Landing::NotMoved(e) => {
                warn!(
                    "Migration of VM {} to host {} failed, VM stays on host {}: {}",
                    vm.id, plan.destination_host_id, plan.source_host_id, e
                );
                Err(Failure::Failed(e))
            }
            Landing::Unknown(e) => Err(Failure::Unresolved(e)),
        }
    }

    async fn locate_after_migration(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
        original: StratusError,
    ) -> Landing {
        let destination = self.probe(plan.destination_host_id, &vm.uuid).await;
        if matches!(destination, Ok(PowerState::PowerOn)) {
            info!(
                "VM {} found running on destination host {} after {}",
                vm.id, plan.destination_host_id, original
            );
            return Landing::Moved;
        }
        let source = self.probe(plan.source_host_id, &vm.uuid).await;
        match (destination, source) {
            (_, Ok(PowerState::PowerOn)) => Landing::NotMoved(original),
            (destination, source) => {
                error!(
                    "VM {} location unknown after {}: destination {:?}, source {:?}",
                    vm.id, original, destination, source
                );
                Landing::Unknown(original)
            }
        }
    }

    /// Persist a finished move: volume bookkeeping first, then
    /// `Running -> Migrating -> Running` on the destination.
    pub(crate) fn record_move(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
        volumes: &[VolumeMigration],
    ) -> StratusResult<VirtualMachineInstance> {
        if !volumes.is_empty() {
            self.inventory.apply_volume_migrations(volumes)?;
        }

        self.engine.transition(
            TransitionRequest::new(vm.id, State::Running, Event::MigrationRequested)
                .at_version(vm.update_count),
        )?;
        let running = self.engine.transition(
            TransitionRequest::new(vm.id, State::Migrating, Event::OperationSucceeded)
                .on_host(plan.destination_host_id),
        )?;

        info!(
            "VM {} migrated from host {} to host {}",
            vm.id, plan.source_host_id, plan.destination_host_id
        );
        Ok(running)
    }
}
