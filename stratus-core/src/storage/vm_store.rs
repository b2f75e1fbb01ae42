use redb::{Database, ReadableTable};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    error::{StratusError, StratusResult},
    state_table::State,
    storage::VM_TABLE,
    types::{ComputeResources, HostId, VirtualMachineInstance, VmId},
};

/// Conditional update of the lifecycle fields of one VM record.
///
/// Applied only when the persisted `(state, update_count)` still equals
/// `(expected_state, expected_update_count)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub vm_id: VmId,
    pub expected_state: State,
    pub expected_update_count: u64,
    pub new_state: State,
    pub host_id: Option<HostId>,
    pub last_host_id: Option<HostId>,
}

/// Durable VM instance records keyed by id.
pub struct VmRecordStore {
    database: Arc<Database>,
}

impl VmRecordStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Register a new VM. Fails if the id is already taken.
    pub fn create(&self, vm: &VirtualMachineInstance) -> StratusResult<()> {
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(VM_TABLE)?;
            if table.get(vm.id.0)?.is_some() {
                return Err(StratusError::runtime_fault(format!(
                    "VM {} already exists",
                    vm.id
                )));
            }
            let serialized = bincode::serialize(vm)?;
            table.insert(vm.id.0, serialized.as_slice())?;
        }
        write_txn.commit()?;

        info!("Registered VM {} ({}) in state {:?}", vm.id, vm.name, vm.state);
        Ok(())
    }

    pub fn get(&self, vm_id: VmId) -> StratusResult<Option<VirtualMachineInstance>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(VM_TABLE)?;
        match table.get(vm_id.0)? {
            Some(data) => Ok(Some(bincode::deserialize(data.value())?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing record is an error.
    pub fn load(&self, vm_id: VmId) -> StratusResult<VirtualMachineInstance> {
        self.get(vm_id)?.ok_or_else(|| StratusError::NotFound {
            resource: format!("VM {}", vm_id),
        })
    }

    pub fn list(&self) -> StratusResult<Vec<VirtualMachineInstance>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(VM_TABLE)?;

        let mut vms = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            vms.push(bincode::deserialize::<VirtualMachineInstance>(value.value())?);
        }
        Ok(vms)
    }

    /// Number of VMs currently occupying `host_id`.
    pub fn count_on_host(&self, host_id: HostId) -> StratusResult<usize> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|vm| vm.state.holds_host() && vm.host_id == Some(host_id))
            .count())
    }

    /// Single-transaction compare-and-swap on `(state, update_count)`.
    ///
    /// Returns the written record, or `None` when the row no longer matches
    /// the expectation (the conditional write affected zero rows).
    pub fn compare_and_swap(
        &self,
        update: &StateUpdate,
    ) -> StratusResult<Option<VirtualMachineInstance>> {
        let write_txn = self.database.begin_write()?;
        let written = {
            let mut table = write_txn.open_table(VM_TABLE)?;
            let current = table.get(update.vm_id.0)?.map(|data| data.value().to_vec());
            let Some(current) = current else {
                return Err(StratusError::NotFound {
                    resource: format!("VM {}", update.vm_id),
                });
            };

            let mut vm: VirtualMachineInstance = bincode::deserialize(&current)?;
            if vm.state != update.expected_state || vm.update_count != update.expected_update_count
            {
                debug!(
                    "CAS miss for VM {}: persisted ({:?}, {}) expected ({:?}, {})",
                    update.vm_id,
                    vm.state,
                    vm.update_count,
                    update.expected_state,
                    update.expected_update_count
                );
                None
            } else {
                vm.state = update.new_state;
                vm.host_id = update.host_id;
                vm.last_host_id = update.last_host_id;
                vm.update_count += 1;

                let serialized = bincode::serialize(&vm)?;
                table.insert(update.vm_id.0, serialized.as_slice())?;
                Some(vm)
            }
        };

        if written.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(written)
    }

    /// Persist a new resource allocation. Not a lifecycle transition, so
    /// `update_count` is left alone.
    pub fn set_resources(&self, vm_id: VmId, resources: ComputeResources) -> StratusResult<()> {
        self.modify(vm_id, |vm| vm.resources = resources)?;
        debug!("Persisted resources {:?} for VM {}", resources, vm_id);
        Ok(())
    }

    pub fn set_update_parameters_pending(&self, vm_id: VmId, pending: bool) -> StratusResult<()> {
        self.modify(vm_id, |vm| vm.update_parameters_pending = pending)
    }

    fn modify<F>(&self, vm_id: VmId, apply: F) -> StratusResult<()>
    where
        F: FnOnce(&mut VirtualMachineInstance),
    {
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(VM_TABLE)?;
            let current = table.get(vm_id.0)?.map(|data| data.value().to_vec());
            let Some(current) = current else {
                return Err(StratusError::NotFound {
                    resource: format!("VM {}", vm_id),
                });
            };
            let mut vm: VirtualMachineInstance = bincode::deserialize(&current)?;
            apply(&mut vm);
            let serialized = bincode::serialize(&vm)?;
            table.insert(vm_id.0, serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_database_tables;
    use crate::types::{AccountId, ZoneId};
    use tempfile::TempDir;

    fn create_store() -> (TempDir, VmRecordStore) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let database = Arc::new(Database::create(&db_path).unwrap());
        init_database_tables(&database).unwrap();
        (temp_dir, VmRecordStore::new(database))
    }

    #[test]
    fn test_cas_applies_once() {
        let (_dir, store) = create_store();
        let vm = VirtualMachineInstance::new(VmId(1), "vm-1", AccountId(1), ZoneId(1));
        store.create(&vm).unwrap();

        let update = StateUpdate {
            vm_id: VmId(1),
            expected_state: State::Stopped,
            expected_update_count: 0,
            new_state: State::Starting,
            host_id: Some(HostId(5)),
            last_host_id: None,
        };

        let written = store.compare_and_swap(&update).unwrap().unwrap();
        assert_eq!(written.update_count, 1);
        assert_eq!(written.host_id, Some(HostId(5)));

        // Same expectation again: row moved on, nothing written
        assert!(store.compare_and_swap(&update).unwrap().is_none());
        assert_eq!(store.load(VmId(1)).unwrap().update_count, 1);
    }

    #[test]
    fn test_set_resources_keeps_update_count() {
        let (_dir, store) = create_store();
        let vm = VirtualMachineInstance::new(VmId(3), "vm-3", AccountId(1), ZoneId(1));
        store.create(&vm).unwrap();

        store
            .set_resources(VmId(3), ComputeResources::new(4, 8192))
            .unwrap();
        let loaded = store.load(VmId(3)).unwrap();
        assert_eq!(loaded.resources, ComputeResources::new(4, 8192));
        assert_eq!(loaded.update_count, 0);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let (_dir, store) = create_store();
        let vm = VirtualMachineInstance::new(VmId(2), "vm-2", AccountId(1), ZoneId(1));
        store.create(&vm).unwrap();
        assert!(store.create(&vm).is_err());
    }
}
