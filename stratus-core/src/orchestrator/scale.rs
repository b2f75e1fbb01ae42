use tracing::{info, warn};

use super::{require_state, Failure, Orchestrator};
use crate::{
    agent::{command::ScaleVmCommand, send_typed},
    error::{StratusError, StratusResult},
    orchestrator::MigrationRequest,
    placement::{PlacementRequest, PlacementTarget, RetryContext},
    state_table::State,
    types::{ComputeResources, VirtualMachineInstance, VmId},
    work_ledger::{OperationType, WorkHandle},
};

impl Orchestrator {
    /// Grow the cpu / memory allocation of a running VM, in place when its
    /// host has room, otherwise after migrating it to a host that does.
    pub async fn scale(
        &self,
        vm_id: VmId,
        resources: ComputeResources,
    ) -> StratusResult<VirtualMachineInstance> {
        let handle = self
            .ledger
            .begin_work(vm_id, OperationType::Scale, None)
            .await?;
        let result = self.scale_with_work(&handle, vm_id, resources).await;
        self.settle(handle, result)
    }

    async fn scale_with_work(
        &self,
        handle: &WorkHandle,
        vm_id: VmId,
        resources: ComputeResources,
    ) -> Result<VirtualMachineInstance, Failure> {
        let vm = self.store().load(vm_id).map_err(Failure::Rejected)?;
        require_state(vm_id, "scale", vm.state, &[State::Running]).map_err(Failure::Rejected)?;
        if !vm.dynamically_scalable {
            return Err(Failure::Rejected(StratusError::resource_unavailable(
                "vm",
                format!("VM {} is not dynamically scalable", vm_id),
            )));
        }
        let delta = vm.resources.scale_up_delta(&resources).ok_or_else(|| {
            Failure::Rejected(StratusError::resource_unavailable(
                "compute offering",
                format!(
                    "VM {} can only scale up from {:?}, requested {:?}",
                    vm_id, vm.resources, resources
                ),
            ))
        })?;

        let ctx = RetryContext {
            vm_id,
            account_id: vm.account_id,
            current_host: vm.host_id,
            request: PlacementRequest {
                zone_id: vm.zone_id,
                pod_id: vm.pod_id,
                cluster_id: None,
                required_capability: vm.hypervisor.clone(),
                preferred_host: None,
            },
            delta,
        };

        let outcome = self
            .placement
            .run(&ctx, |target| self.scale_attempt(handle, vm_id, target, resources))
            .await;

        match outcome {
            Ok(outcome) => {
                info!(
                    "VM {} scaled to {:?} on {:?} after {} attempt(s)",
                    vm_id, resources, outcome.target, outcome.attempts
                );
                Ok(outcome.value)
            }
            Err(e @ StratusError::ReconciliationRequired { .. }) => Err(Failure::Unresolved(e)),
            Err(e) => Err(Failure::Failed(e)),
        }
    }

    async fn scale_attempt(
        &self,
        handle: &WorkHandle,
        vm_id: VmId,
        target: PlacementTarget,
        resources: ComputeResources,
    ) -> StratusResult<VirtualMachineInstance> {
        let vm = self.store().load(vm_id)?;

        let host_id = match target {
            PlacementTarget::InPlace(host_id) => host_id,
            PlacementTarget::Migrate { destination } => {
                let source = vm.host_id.ok_or_else(|| {
                    StratusError::runtime_fault(format!("running VM {} has no host", vm_id))
                })?;
                let plan =
                    self.plan_migration(&MigrationRequest::compute(vm_id, source, destination))?;
                let (vm, _) = self.check_migration_preconditions(&plan).await?;
                self.ledger.record_plan(handle, &plan)?;
                match self.migrate_compute(&vm, &plan).await {
                    Ok(_) => destination,
                    Err(Failure::Rejected(e)) | Err(Failure::Failed(e)) => return Err(e),
                    Err(Failure::Unresolved(e)) => {
                        return Err(StratusError::ReconciliationRequired {
                            vm_id,
                            details: format!("migration for scale-up left VM unplaced: {}", e),
                        })
                    }
                }
            }
        };

        let command = ScaleVmCommand {
            vm_uuid: vm.uuid.clone(),
            resources,
        };
        if let Err(e) = send_typed(
            self.dispatcher.as_ref(),
            host_id,
            &command,
            self.waits.scale_wait,
        )
        .await
        {
            warn!("Scaling VM {} on host {} failed: {}", vm_id, host_id, e);
            return Err(e);
        }

        self.store().set_resources(vm_id, resources)?;
        self.store().load(vm_id)
    }
}
