//! State machine engine
//!
//! Applies the transition table to the VM record store. Every write of
//! `state`, `host_id`, `last_host_id` and `update_count` goes through
//! [`StateMachine::transition`], whose conditional write is the single
//! linearization point for a VM.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    error::{StratusError, StratusResult},
    fail_point,
    state_table::{next_state, Event, State},
    storage::{StateUpdate, VmRecordStore},
    types::{HostId, VirtualMachineInstance, VmId},
};

/// Input to [`StateMachine::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub vm_id: VmId,
    pub expected_state: State,
    /// Version the caller read; `None` uses the version read inside the call
    pub expected_update_count: Option<u64>,
    pub event: Event,
    /// Host the VM occupies after the transition, if the next state holds one
    pub host_id: Option<HostId>,
}

impl TransitionRequest {
    pub fn new(vm_id: VmId, expected_state: State, event: Event) -> Self {
        Self {
            vm_id,
            expected_state,
            expected_update_count: None,
            event,
            host_id: None,
        }
    }

    pub fn on_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn at_version(mut self, update_count: u64) -> Self {
        self.expected_update_count = Some(update_count);
        self
    }
}

pub struct StateMachine {
    store: Arc<VmRecordStore>,
}

impl StateMachine {
    pub fn new(store: Arc<VmRecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<VmRecordStore> {
        &self.store
    }

    /// Move `vm_id` from `expected` by `event`, keeping its current host.
    pub fn apply_transition(
        &self,
        vm_id: VmId,
        expected: State,
        event: Event,
    ) -> StratusResult<State> {
        let vm = self.transition(TransitionRequest::new(vm_id, expected, event))?;
        Ok(vm.state)
    }

    /// Validate and apply one transition. Returns the record as written.
    ///
    /// Errors:
    /// - `InvalidStateTransition` when the persisted state differs from the
    ///   expectation or the pair is not in the table. Nothing is written.
    /// - `ConcurrencyConflict` when the pinned update count is stale or the
    ///   record changed between read and write.
    /// - `RuntimeFault` when the VM is missing or the resulting host would
    ///   violate the host invariant.
    pub fn transition(&self, request: TransitionRequest) -> StratusResult<VirtualMachineInstance> {
        let vm = self.store.get(request.vm_id)?.ok_or_else(|| {
            StratusError::runtime_fault(format!("VM {} not found", request.vm_id))
        })?;

        let rejected = |vm: &VirtualMachineInstance| {
            debug!(
                "Rejected {:?} for VM {}: persisted {:?}, expected {:?}",
                request.event, request.vm_id, vm.state, request.expected_state
            );
            StratusError::InvalidStateTransition {
                vm_id: request.vm_id,
                expected: request.expected_state,
                actual: vm.state,
                event: request.event,
            }
        };

        let Some(next) = next_state(request.expected_state, request.event) else {
            return Err(rejected(&vm));
        };

        // A caller pinned to a version that moved lost the race, whatever
        // the winner wrote.
        let expected_update_count = request.expected_update_count.unwrap_or(vm.update_count);
        if expected_update_count != vm.update_count {
            return Err(StratusError::conflict(
                request.vm_id,
                format!(
                    "update count moved from {} to {}",
                    expected_update_count, vm.update_count
                ),
            ));
        }
        if vm.state != request.expected_state {
            return Err(rejected(&vm));
        }

        let (host_id, last_host_id) = resolve_hosts(&vm, next, request.host_id)?;

        fail_point!("state_machine::before_cas");

        let update = StateUpdate {
            vm_id: request.vm_id,
            expected_state: request.expected_state,
            expected_update_count,
            new_state: next,
            host_id,
            last_host_id,
        };

        match self.store.compare_and_swap(&update)? {
            Some(written) => {
                info!(
                    "VM {} {:?} --{:?}--> {:?} (host {:?}, version {})",
                    request.vm_id,
                    request.expected_state,
                    request.event,
                    next,
                    written.host_id,
                    written.update_count
                );
                Ok(written)
            }
            None => {
                warn!(
                    "Concurrent update on VM {} while applying {:?}",
                    request.vm_id, request.event
                );
                Err(StratusError::conflict(
                    request.vm_id,
                    format!("record changed while applying {:?}", request.event),
                ))
            }
        }
    }
}

/// Host fields after moving `vm` into `next`.
///
/// A host-holding state keeps (or takes) a host; any other state clears it
/// and remembers the previous one in `last_host_id`.
fn resolve_hosts(
    vm: &VirtualMachineInstance,
    next: State,
    requested: Option<HostId>,
) -> StratusResult<(Option<HostId>, Option<HostId>)> {
    if next.holds_host() {
        let host = requested.or(vm.host_id).ok_or_else(|| {
            StratusError::runtime_fault(format!(
                "VM {} entering {:?} without a host",
                vm.id, next
            ))
        })?;
        let last_host = match vm.host_id {
            Some(previous) if previous != host => Some(previous),
            _ => vm.last_host_id,
        };
        Ok((Some(host), last_host))
    } else {
        Ok((None, vm.host_id.or(vm.last_host_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::init_database_tables;
    use crate::types::{AccountId, ZoneId};
    use redb::Database;
    use tempfile::TempDir;

    fn create_engine() -> (TempDir, StateMachine) {
        let temp_dir = TempDir::new().unwrap();
        let database = Arc::new(Database::create(temp_dir.path().join("sm.db")).unwrap());
        init_database_tables(&database).unwrap();
        let store = Arc::new(VmRecordStore::new(database));
        (temp_dir, StateMachine::new(store))
    }

    fn register(engine: &StateMachine, id: u64) {
        let vm = VirtualMachineInstance::new(VmId(id), format!("vm-{}", id), AccountId(1), ZoneId(1));
        engine.store().create(&vm).unwrap();
    }

    #[test]
    fn test_start_then_stop_tracks_hosts() {
        let (_dir, engine) = create_engine();
        register(&engine, 1);

        let vm = engine
            .transition(
                TransitionRequest::new(VmId(1), State::Stopped, Event::StartRequested)
                    .on_host(HostId(5)),
            )
            .unwrap();
        assert_eq!(vm.state, State::Starting);
        assert_eq!(vm.host_id, Some(HostId(5)));

        engine
            .apply_transition(VmId(1), State::Starting, Event::OperationSucceeded)
            .unwrap();
        engine
            .apply_transition(VmId(1), State::Running, Event::StopRequested)
            .unwrap();
        let state = engine
            .apply_transition(VmId(1), State::Stopping, Event::OperationSucceeded)
            .unwrap();
        assert_eq!(state, State::Stopped);

        let vm = engine.store().load(VmId(1)).unwrap();
        assert_eq!(vm.host_id, None);
        assert_eq!(vm.last_host_id, Some(HostId(5)));
        assert_eq!(vm.update_count, 4);
    }

    #[test]
    fn test_wrong_expected_state_is_invalid() {
        let (_dir, engine) = create_engine();
        register(&engine, 2);

        let err = engine
            .apply_transition(VmId(2), State::Running, Event::StopRequested)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
        assert_eq!(engine.store().load(VmId(2)).unwrap().update_count, 0);
    }

    #[test]
    fn test_stale_version_is_conflict() {
        let (_dir, engine) = create_engine();
        register(&engine, 3);

        let err = engine
            .transition(
                TransitionRequest::new(VmId(3), State::Stopped, Event::StartRequested)
                    .on_host(HostId(5))
                    .at_version(7),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    }

    #[test]
    fn test_host_holding_state_requires_host() {
        let (_dir, engine) = create_engine();
        register(&engine, 4);

        let err = engine
            .apply_transition(VmId(4), State::Stopped, Event::StartRequested)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeFault);
        assert_eq!(engine.store().load(VmId(4)).unwrap().state, State::Stopped);
    }

    #[test]
    fn test_missing_vm_is_runtime_fault() {
        let (_dir, engine) = create_engine();
        let err = engine
            .apply_transition(VmId(99), State::Stopped, Event::StartRequested)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeFault);
    }
}
