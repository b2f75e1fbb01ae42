//! Crash recovery
//!
//! Scans `Started` work items owned by this node, asks the hosts what
//! actually happened and drives each VM to the matching stable state. Runs
//! once at process start and, optionally, on a fixed interval.

use futures::future::join;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    agent::{probe_power_state, AgentDispatcher},
    config::RecoveryConfig,
    error::{StratusError, StratusResult},
    state_machine::{StateMachine, TransitionRequest},
    state_table::{Event, State},
    storage::{Inventory, VolumeMigration},
    types::{HostId, MigrationPlan, PowerState, VirtualMachineInstance},
    work_ledger::{Step, WorkItem, WorkLedger},
};

/// What one scan did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Items closed as `Done`
    pub resolved: Vec<Uuid>,
    /// Items left `Started` for the next scan
    pub deferred: Vec<Uuid>,
    /// Items closed as `Error` because their VM is gone
    pub failed: Vec<Uuid>,
}

enum Decision {
    /// Ground truth is known and persisted
    Resolved,
    /// A host did not answer; try again later
    Deferred,
}

pub struct RecoveryScanner {
    ledger: Arc<WorkLedger>,
    engine: Arc<StateMachine>,
    inventory: Arc<Inventory>,
    dispatcher: Arc<dyn AgentDispatcher>,
    probe_wait: Duration,
}

impl RecoveryScanner {
    pub fn new(
        ledger: Arc<WorkLedger>,
        engine: Arc<StateMachine>,
        inventory: Arc<Inventory>,
        dispatcher: Arc<dyn AgentDispatcher>,
        probe_wait: Duration,
    ) -> Self {
        Self {
            ledger,
            engine,
            inventory,
            dispatcher,
            probe_wait,
        }
    }

    /// Resolve every `Started` item owned by this node.
    pub async fn scan(&self) -> StratusResult<RecoveryReport> {
        let items = self.ledger.list_started(self.ledger.node_id())?;
        let mut report = RecoveryReport::default();
        if items.is_empty() {
            debug!("Recovery scan found no unfinished work");
            return Ok(report);
        }

        info!("Recovery scan found {} unfinished work item(s)", items.len());
        for item in items {
            let _lock = match self.ledger.lock_vm(item.vm_id).await {
                Ok(lock) => lock,
                Err(e) => {
                    debug!("VM {} busy, deferring work {}: {}", item.vm_id, item.id, e);
                    report.deferred.push(item.id);
                    continue;
                }
            };

            let Some(vm) = self.engine.store().get(item.vm_id)? else {
                error!(
                    "Work {} refers to VM {} which no longer exists",
                    item.id, item.vm_id
                );
                if self.ledger.finish_recovered(&item, Step::Error)? {
                    report.failed.push(item.id);
                }
                continue;
            };

            match self.reconcile(&item, &vm).await {
                Ok(Decision::Resolved) => {
                    if self.ledger.finish_recovered(&item, Step::Done)? {
                        report.resolved.push(item.id);
                    }
                }
                Ok(Decision::Deferred) => report.deferred.push(item.id),
                Err(e) => {
                    warn!("Recovery of VM {} (work {}) failed: {}", vm.id, item.id, e);
                    report.deferred.push(item.id);
                }
            }
        }

        info!(
            "Recovery scan resolved {}, deferred {}, failed {}",
            report.resolved.len(),
            report.deferred.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Start the periodic scan described by `config`. Returns `None` when
    /// recovery is disabled.
    pub fn start(self: Arc<Self>, config: &RecoveryConfig) -> Option<JoinHandle<()>> {
        if !config.enabled {
            info!("Periodic recovery scan disabled");
            return None;
        }
        info!("Recovery scan every {:?}", config.scan_interval);
        Some(self.spawn(config.scan_interval))
    }

    /// Run [`scan`](Self::scan) every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.scan().await {
                    error!("Recovery scan failed: {}", e);
                }
            }
        })
    }

    async fn reconcile(&self, item: &WorkItem, vm: &VirtualMachineInstance) -> StratusResult<Decision> {
        match (&item.plan, vm.state) {
            (Some(plan), State::Migrating) | (Some(plan), State::Running) => {
                self.reconcile_migration(vm, plan).await
            }
            (_, State::Starting) | (_, State::Stopping) | (_, State::Migrating) => {
                self.reconcile_transient(vm).await
            }
            (_, state) => {
                debug!(
                    "VM {} already settled in {:?}, closing work {}",
                    vm.id, state, item.id
                );
                Ok(Decision::Resolved)
            }
        }
    }

    /// `Starting` / `Stopping`: the VM's host knows whether it is powered on.
    async fn reconcile_transient(&self, vm: &VirtualMachineInstance) -> StratusResult<Decision> {
        let host_id = vm.host_id.ok_or_else(|| {
            StratusError::runtime_fault(format!("VM {} in {:?} has no host", vm.id, vm.state))
        })?;

        let event = match self.probe(host_id, vm).await {
            Some(PowerState::PowerOn) => Event::AgentReportsRunning,
            Some(PowerState::PowerOff) => Event::AgentReportsStopped,
            _ => return Ok(Decision::Deferred),
        };

        let written = self.engine.transition(
            TransitionRequest::new(vm.id, vm.state, event).at_version(vm.update_count),
        )?;
        info!(
            "Recovered VM {} from {:?} to {:?} on host {:?}",
            vm.id, vm.state, written.state, written.host_id
        );
        Ok(Decision::Resolved)
    }

    /// A migration died somewhere between dispatch and the final write.
    async fn reconcile_migration(
        &self,
        vm: &VirtualMachineInstance,
        plan: &MigrationPlan,
    ) -> StratusResult<Decision> {
        let (source, destination) = join(
            self.probe(plan.source_host_id, vm),
            self.probe(plan.destination_host_id, vm),
        )
        .await;
        info!(
            "VM {} migration {} -> {}: source {:?}, destination {:?}",
            vm.id, plan.source_host_id, plan.destination_host_id, source, destination
        );

        match (source, destination) {
            (Some(PowerState::PowerOff), Some(PowerState::PowerOn))
            | (None, Some(PowerState::PowerOn)) => {
                if vm.host_id == Some(plan.destination_host_id) {
                    return Ok(Decision::Resolved);
                }
                // Volumes before the host move; a repeated pool rewrite is a no-op
                if plan.moves_storage() {
                    let migrations: Vec<VolumeMigration> = plan
                        .volume_to_pool
                        .iter()
                        .map(|(volume_id, pool_id)| VolumeMigration {
                            volume_id: *volume_id,
                            destination_pool: *pool_id,
                            path: None,
                        })
                        .collect();
                    self.inventory.apply_volume_migrations(&migrations)?;
                }
                self.land_on(vm, plan.destination_host_id)?;
                Ok(Decision::Resolved)
            }
            (Some(PowerState::PowerOn), _) => {
                if vm.state == State::Running && vm.host_id == Some(plan.source_host_id) {
                    return Ok(Decision::Resolved);
                }
                self.land_on(vm, plan.source_host_id)?;
                Ok(Decision::Resolved)
            }
            (Some(PowerState::PowerOff), Some(PowerState::PowerOff)) => {
                let written = self.engine.transition(
                    TransitionRequest::new(vm.id, vm.state, Event::AgentReportsStopped)
                        .at_version(vm.update_count),
                )?;
                warn!(
                    "VM {} runs on neither host after migration, marked {:?}",
                    vm.id, written.state
                );
                Ok(Decision::Resolved)
            }
            _ => Ok(Decision::Deferred),
        }
    }

    fn land_on(&self, vm: &VirtualMachineInstance, host_id: HostId) -> StratusResult<()> {
        let written = self.engine.transition(
            TransitionRequest::new(vm.id, vm.state, Event::AgentReportsRunning)
                .on_host(host_id)
                .at_version(vm.update_count),
        )?;
        info!(
            "Recovered VM {} to {:?} on host {}",
            vm.id, written.state, host_id
        );
        Ok(())
    }

    /// Known power state, or `None` when the host did not answer or could
    /// not tell.
    async fn probe(&self, host_id: HostId, vm: &VirtualMachineInstance) -> Option<PowerState> {
        match probe_power_state(self.dispatcher.as_ref(), host_id, &vm.uuid, self.probe_wait).await
        {
            Ok(PowerState::Unknown) => None,
            Ok(state) => Some(state),
            Err(e) => {
                debug!("Probe of VM {} on host {} failed: {}", vm.id, host_id, e);
                None
            }
        }
    }
}
