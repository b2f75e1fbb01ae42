use tracing::{error, info, warn};

use super::{require_state, Failure, Orchestrator, Resolution};
use crate::{
    agent::{
        command::{StartCommand, StopCommand},
        send_typed,
    },
    error::{StratusError, StratusResult},
    placement::{ExcludeList, PlacementRequest},
    state_machine::TransitionRequest,
    state_table::{Event, State},
    types::{HostId, VirtualMachineInstance, VmId},
    work_ledger::OperationType,
};

impl Orchestrator {
    /// Start a stopped VM on a host chosen by the planner, trying up to
    /// `start_retries` hosts.
    pub async fn start(&self, vm_id: VmId) -> StratusResult<VirtualMachineInstance> {
        let handle = self
            .ledger
            .begin_work(vm_id, OperationType::Start, None)
            .await?;
        let result = self.start_with_work(vm_id).await;
        self.settle(handle, result)
    }

    async fn start_with_work(&self, vm_id: VmId) -> Result<VirtualMachineInstance, Failure> {
        let vm = self.store().load(vm_id).map_err(Failure::Rejected)?;
        require_state(vm_id, "start", vm.state, &[State::Stopped]).map_err(Failure::Rejected)?;
        let guru = self.gurus.guru_for(vm.vm_type).map_err(Failure::Rejected)?;

        let mut excluded = ExcludeList::new();
        let mut last_error: Option<StratusError> = None;

        for attempt in 1..=self.waits.start_retries {
            let request = PlacementRequest {
                zone_id: vm.zone_id,
                pod_id: vm.pod_id,
                cluster_id: None,
                required_capability: vm.hypervisor.clone(),
                preferred_host: vm.last_host_id.filter(|h| !excluded.should_avoid(*h)),
            };
            let Some(host_id) = self.planner.select_host(&request, &excluded).await? else {
                break;
            };

            let current = self.store().load(vm_id)?;
            let starting = self
                .engine
                .transition(
                    TransitionRequest::new(vm_id, State::Stopped, Event::StartRequested)
                        .on_host(host_id)
                        .at_version(current.update_count),
                )
                .map_err(|e| {
                    if last_error.is_none() {
                        Failure::Rejected(e)
                    } else {
                        Failure::Failed(e)
                    }
                })?;

            info!(
                "Starting VM {} on host {} (attempt {}/{})",
                vm_id, host_id, attempt, self.waits.start_retries
            );

            let command = StartCommand {
                vm_id,
                vm_uuid: vm.uuid.clone(),
                resources: vm.resources,
                regenerate_credentials: vm.update_parameters_pending,
            };
            let resolution = match send_typed(
                self.dispatcher.as_ref(),
                host_id,
                &command,
                self.waits.start_wait,
            )
            .await
            {
                Ok(()) => Resolution::Succeeded,
                Err(e) if e.kind().is_ambiguous() => {
                    self.resolve_by_probe(host_id, &vm.uuid, true, e).await
                }
                Err(e) => Resolution::Failed(e),
            };

            let failure = match resolution {
                Resolution::Succeeded => match guru.finalize_start(&starting, host_id).await {
                    Ok(()) => return self.finish_start(&starting).map_err(Failure::Unresolved),
                    Err(e) => {
                        warn!("finalize_start rejected VM {} on host {}: {}", vm_id, host_id, e);
                        self.force_stop(&starting, host_id).await;
                        e
                    }
                },
                Resolution::Failed(e) => e,
                Resolution::Unknown(e) => return Err(Failure::Unresolved(e)),
            };

            warn!(
                "Start of VM {} on host {} failed: {}",
                vm_id, host_id, failure
            );
            self.engine
                .transition(TransitionRequest::new(
                    vm_id,
                    State::Starting,
                    Event::OperationFailed,
                ))
                .map_err(Failure::Unresolved)?;
            excluded.add_host(host_id);
            last_error = Some(failure);
        }

        let reason = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidate host".to_string());
        let err = StratusError::resource_unavailable(
            "host",
            format!("unable to start VM {}: {}", vm_id, reason),
        );
        if last_error.is_some() {
            Err(Failure::Failed(err))
        } else {
            Err(Failure::Rejected(err))
        }
    }

    fn finish_start(
        &self,
        starting: &VirtualMachineInstance,
    ) -> StratusResult<VirtualMachineInstance> {
        let running = self.engine.transition(TransitionRequest::new(
            starting.id,
            State::Starting,
            Event::OperationSucceeded,
        ))?;
        if starting.update_parameters_pending {
            self.store()
                .set_update_parameters_pending(starting.id, false)?;
        }
        info!("VM {} running on host {:?}", running.id, running.host_id);
        self.store().load(running.id)
    }

    /// Best-effort power-off after a start the guru refused.
    async fn force_stop(&self, vm: &VirtualMachineInstance, host_id: HostId) {
        let command = StopCommand {
            vm_id: vm.id,
            vm_uuid: vm.uuid.clone(),
            force: true,
        };
        if let Err(e) = send_typed(
            self.dispatcher.as_ref(),
            host_id,
            &command,
            self.waits.stop_wait,
        )
        .await
        {
            error!(
                "Unable to stop VM {} on host {} after a refused start: {}",
                vm.id, host_id, e
            );
        }
    }

    /// Stop a running VM. A missing answer is never taken as success.
    pub async fn stop(&self, vm_id: VmId, force: bool) -> StratusResult<VirtualMachineInstance> {
        let handle = self
            .ledger
            .begin_work(vm_id, OperationType::Stop, None)
            .await?;
        let result = self.stop_with_work(vm_id, force).await;
        self.settle(handle, result)
    }

    async fn stop_with_work(
        &self,
        vm_id: VmId,
        force: bool,
    ) -> Result<VirtualMachineInstance, Failure> {
        let vm = self.store().load(vm_id).map_err(Failure::Rejected)?;
        require_state(vm_id, "stop", vm.state, &[State::Running]).map_err(Failure::Rejected)?;
        let host_id = vm.host_id.ok_or_else(|| {
            Failure::Rejected(StratusError::runtime_fault(format!(
                "running VM {} has no host",
                vm_id
            )))
        })?;
        let guru = self.gurus.guru_for(vm.vm_type).map_err(Failure::Rejected)?;

        guru.prepare_stop(&vm).await.map_err(Failure::Rejected)?;
        self.engine
            .transition(
                TransitionRequest::new(vm_id, State::Running, Event::StopRequested)
                    .at_version(vm.update_count),
            )
            .map_err(Failure::Rejected)?;

        let command = StopCommand {
            vm_id,
            vm_uuid: vm.uuid.clone(),
            force,
        };
        let resolution = match send_typed(
            self.dispatcher.as_ref(),
            host_id,
            &command,
            self.waits.stop_wait,
        )
        .await
        {
            Ok(()) => Resolution::Succeeded,
            Err(e) if e.kind().is_ambiguous() => {
                self.resolve_by_probe(host_id, &vm.uuid, false, e).await
            }
            Err(e) => Resolution::Failed(e),
        };

        match resolution {
            Resolution::Succeeded => {
                let stopped = self
                    .engine
                    .transition(TransitionRequest::new(
                        vm_id,
                        State::Stopping,
                        Event::OperationSucceeded,
                    ))
                    .map_err(Failure::Unresolved)?;
                if let Err(e) = guru.finalize_stop(&stopped).await {
                    warn!("finalize_stop for VM {} failed: {}", vm_id, e);
                }
                info!("VM {} stopped on host {}", vm_id, host_id);
                Ok(stopped)
            }
            Resolution::Failed(e) => {
                warn!("Stop of VM {} on host {} failed: {}", vm_id, host_id, e);
                self.engine
                    .transition(TransitionRequest::new(
                        vm_id,
                        State::Stopping,
                        Event::OperationFailed,
                    ))
                    .map_err(Failure::Unresolved)?;
                Err(Failure::Failed(e))
            }
            Resolution::Unknown(e) => Err(Failure::Unresolved(e)),
        }
    }

    /// `Stopped -> Destroyed`, or `Error -> Expunging`.
    pub async fn destroy(&self, vm_id: VmId) -> StratusResult<State> {
        self.local_transition(
            vm_id,
            OperationType::Destroy,
            &[State::Stopped, State::Error],
            Event::DestroyRequested,
        )
        .await
    }

    /// `Destroyed -> Stopped`
    pub async fn recover(&self, vm_id: VmId) -> StratusResult<State> {
        self.local_transition(
            vm_id,
            OperationType::Recover,
            &[State::Destroyed],
            Event::RecoveryRequested,
        )
        .await
    }

    /// `Destroyed | Stopped -> Expunging`
    pub async fn expunge(&self, vm_id: VmId) -> StratusResult<State> {
        self.local_transition(
            vm_id,
            OperationType::Expunge,
            &[State::Destroyed, State::Stopped],
            Event::ExpungeRequested,
        )
        .await
    }

    /// Transition that involves no host, under a work item.
    async fn local_transition(
        &self,
        vm_id: VmId,
        operation: OperationType,
        allowed: &[State],
        event: Event,
    ) -> StratusResult<State> {
        let handle = self.ledger.begin_work(vm_id, operation, None).await?;
        let result = (|| -> StratusResult<State> {
            let vm = self.store().load(vm_id)?;
            require_state(vm_id, &format!("{:?}", operation), vm.state, allowed)?;
            let written = self.engine.transition(
                TransitionRequest::new(vm_id, vm.state, event).at_version(vm.update_count),
            )?;
            Ok(written.state)
        })()
        .map_err(Failure::Rejected);
        self.settle(handle, result)
    }
}
