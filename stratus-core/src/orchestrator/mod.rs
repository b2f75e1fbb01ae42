//! Lifecycle and migration orchestration
//!
//! Every public operation runs under a work item. Preconditions are checked
//! under the VM lock before anything is dispatched; state transitions are
//! written only after the host has reported the outcome.

mod lifecycle;
mod migration;
mod scale;
mod storage_motion;

pub use migration::MigrationRequest;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    agent::{probe_power_state, AgentDispatcher},
    config::{OrchestratorConfig, StratusConfig},
    error::{StratusError, StratusResult},
    guru::GuruRegistry,
    placement::{
        CapacityManager, DeploymentPlanner, PlacementRetryLoop, ResourceAccounting,
    },
    state_machine::StateMachine,
    state_table::State,
    storage::{Inventory, VmRecordStore},
    types::{HostId, PowerState, VmId},
    work_ledger::{WorkHandle, WorkLedger},
};

/// Reports VM-snapshot tasks that block migration
#[async_trait]
pub trait SnapshotTracker: Send + Sync {
    async fn has_pending_snapshot(&self, vm_id: VmId) -> StratusResult<bool>;
}

/// Collaborators of the orchestrator, passed in explicitly
pub struct OrchestratorDeps {
    pub engine: Arc<StateMachine>,
    pub ledger: Arc<WorkLedger>,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub inventory: Arc<Inventory>,
    pub planner: Arc<dyn DeploymentPlanner>,
    pub capacity: Arc<dyn CapacityManager>,
    pub accounting: Arc<dyn ResourceAccounting>,
    pub gurus: Arc<GuruRegistry>,
    pub snapshots: Arc<dyn SnapshotTracker>,
}

pub struct Orchestrator {
    waits: OrchestratorConfig,
    command_wait: Duration,
    probe_wait: Duration,
    engine: Arc<StateMachine>,
    ledger: Arc<WorkLedger>,
    dispatcher: Arc<dyn AgentDispatcher>,
    inventory: Arc<Inventory>,
    planner: Arc<dyn DeploymentPlanner>,
    gurus: Arc<GuruRegistry>,
    snapshots: Arc<dyn SnapshotTracker>,
    placement: PlacementRetryLoop,
}

/// How an operation body ended, deciding the work item's final step
pub(crate) enum Failure {
    /// Refused before anything was dispatched or written
    Rejected(StratusError),
    /// Definite failure; the VM is back in its last known-good state
    Failed(StratusError),
    /// Outcome unknown; the item stays `Started` for the recovery scan
    Unresolved(StratusError),
}

impl From<StratusError> for Failure {
    fn from(err: StratusError) -> Self {
        Failure::Failed(err)
    }
}

/// Result of reconciling an ambiguous dispatch with a status probe
pub(crate) enum Resolution {
    Succeeded,
    Failed(StratusError),
    Unknown(StratusError),
}

impl Orchestrator {
    pub fn new(config: &StratusConfig, deps: OrchestratorDeps) -> Self {
        let placement = PlacementRetryLoop::new(
            deps.planner.clone(),
            deps.capacity,
            deps.accounting,
            config.placement.max_retries,
        );
        Self {
            waits: config.orchestrator.clone(),
            command_wait: config.agent.command_wait,
            probe_wait: config.agent.probe_wait,
            engine: deps.engine,
            ledger: deps.ledger,
            dispatcher: deps.dispatcher,
            inventory: deps.inventory,
            planner: deps.planner,
            gurus: deps.gurus,
            snapshots: deps.snapshots,
            placement,
        }
    }

    fn store(&self) -> &VmRecordStore {
        self.engine.store()
    }

    /// Close the work item according to how the operation ended.
    fn settle<T>(&self, handle: WorkHandle, result: Result<T, Failure>) -> StratusResult<T> {
        match result {
            Ok(value) => {
                self.ledger.complete_work(handle)?;
                Ok(value)
            }
            Err(Failure::Rejected(err)) => {
                debug!("Work {} rejected: {}", handle.id(), err);
                self.ledger.cancel_work(handle)?;
                Err(err)
            }
            Err(Failure::Failed(err)) => {
                warn!("Work {} failed: {}", handle.id(), err);
                self.ledger.fail_work(handle)?;
                Err(err)
            }
            Err(Failure::Unresolved(err)) => {
                self.ledger.abandon(handle);
                Err(err)
            }
        }
    }

    async fn probe(&self, host_id: HostId, vm_uuid: &str) -> StratusResult<PowerState> {
        probe_power_state(self.dispatcher.as_ref(), host_id, vm_uuid, self.probe_wait).await
    }

    /// Reconcile an ambiguous dispatch by asking `host_id` whether the VM
    /// is powered on. `on_means_success` says which answer means the
    /// command took effect.
    async fn resolve_by_probe(
        &self,
        host_id: HostId,
        vm_uuid: &str,
        on_means_success: bool,
        original: StratusError,
    ) -> Resolution {
        match self.probe(host_id, vm_uuid).await {
            Ok(PowerState::PowerOn) if on_means_success => Resolution::Succeeded,
            Ok(PowerState::PowerOff) if !on_means_success => Resolution::Succeeded,
            Ok(PowerState::PowerOn) | Ok(PowerState::PowerOff) => Resolution::Failed(original),
            Ok(PowerState::Unknown) => {
                warn!(
                    "Host {} cannot tell the power state of VM {}",
                    host_id, vm_uuid
                );
                Resolution::Unknown(original)
            }
            Err(probe_err) => {
                warn!(
                    "Status probe of VM {} on host {} failed: {}",
                    vm_uuid, host_id, probe_err
                );
                Resolution::Unknown(original)
            }
        }
    }
}

fn require_state(
    vm_id: VmId,
    operation: &str,
    actual: State,
    expected: &[State],
) -> StratusResult<()> {
    if expected.contains(&actual) {
        Ok(())
    } else {
        Err(StratusError::InvalidVmState {
            vm_id,
            operation: operation.to_string(),
            expected: expected.to_vec(),
            actual,
        })
    }
}
