//! Work ledger
//!
//! Durable record of in-flight lifecycle operations plus the per-VM
//! advisory lock. An operation begins work before it dispatches anything,
//! and its [`WorkHandle`] holds the VM lock until the item is completed,
//! failed, cancelled or abandoned for the recovery scan.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{StratusError, StratusResult},
    fail_point,
    storage::{ACTIVE_WORK_TABLE, WORK_TABLE},
    types::{MigrationPlan, NodeId, VmId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Started,
    Done,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Start,
    Stop,
    Migrate,
    MigrateWithStorage,
    Scale,
    Destroy,
    Recover,
    Expunge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub vm_id: VmId,
    pub owner_node_id: NodeId,
    pub step: Step,
    pub operation: OperationType,
    /// Set for migrations so recovery knows both candidate hosts
    pub plan: Option<MigrationPlan>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proof of an in-flight operation. Dropping it releases the VM lock but
/// leaves the item `Started`.
#[derive(Debug)]
pub struct WorkHandle {
    item: WorkItem,
    _guard: OwnedMutexGuard<()>,
}

impl WorkHandle {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn id(&self) -> Uuid {
        self.item.id
    }

    pub fn vm_id(&self) -> VmId {
        self.item.vm_id
    }
}

/// Exclusive in-process lock on a VM without a work item, used by the
/// recovery scan to resolve an item another process abandoned.
pub struct VmLockGuard {
    _guard: OwnedMutexGuard<()>,
}

pub struct WorkLedger {
    database: Arc<Database>,
    node_id: NodeId,
    lock_wait: Duration,
    locks: DashMap<VmId, Arc<Mutex<()>>>,
}

impl WorkLedger {
    pub fn new(database: Arc<Database>, node_id: NodeId, lock_wait: Duration) -> Self {
        Self {
            database,
            node_id,
            lock_wait,
            locks: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Take the VM lock and persist a `Started` item for `operation`.
    ///
    /// Fails with `ConcurrencyConflict` when the lock is not free within
    /// `lock_wait` or when any `Started` item already exists for the VM.
    pub async fn begin_work(
        &self,
        vm_id: VmId,
        operation: OperationType,
        plan: Option<MigrationPlan>,
    ) -> StratusResult<WorkHandle> {
        let guard = self.acquire(vm_id).await?;

        let now = Utc::now();
        let item = WorkItem {
            id: Uuid::new_v4(),
            vm_id,
            owner_node_id: self.node_id,
            step: Step::Started,
            operation,
            plan,
            created_at: now,
            updated_at: now,
        };

        fail_point!("work_ledger::begin_work");

        let write_txn = self.database.begin_write()?;
        {
            let mut active = write_txn.open_table(ACTIVE_WORK_TABLE)?;
            let existing = active.get(vm_id.0)?.map(|id| id.value().to_string());
            if let Some(existing) = existing {
                return Err(StratusError::conflict(
                    vm_id,
                    format!("work item {} is still in progress", existing),
                ));
            }

            let id = item.id.to_string();
            let mut work = write_txn.open_table(WORK_TABLE)?;
            let serialized = bincode::serialize(&item)?;
            work.insert(id.as_str(), serialized.as_slice())?;
            active.insert(vm_id.0, id.as_str())?;
        }
        write_txn.commit()?;

        info!(
            "Began {:?} work {} for VM {} on node {}",
            operation, item.id, vm_id, self.node_id
        );
        Ok(WorkHandle {
            item,
            _guard: guard,
        })
    }

    /// Mark the operation `Done` and release the VM lock.
    pub fn complete_work(&self, handle: WorkHandle) -> StratusResult<()> {
        self.finish(handle, Step::Done)
    }

    /// Mark the operation `Error` and release the VM lock. VM state is the
    /// caller's business.
    pub fn fail_work(&self, handle: WorkHandle) -> StratusResult<()> {
        self.finish(handle, Step::Error)
    }

    /// Mark an operation that never dispatched anything `Cancelled`.
    pub fn cancel_work(&self, handle: WorkHandle) -> StratusResult<()> {
        self.finish(handle, Step::Cancelled)
    }

    /// Release the VM lock but keep the item `Started` for the recovery scan.
    pub fn abandon(&self, handle: WorkHandle) {
        let vm_id = handle.vm_id();
        warn!(
            "Leaving {:?} work {} for VM {} to the recovery scan",
            handle.item.operation, handle.item.id, vm_id
        );
        drop(handle);
        self.release_lock_entry(vm_id);
    }

    fn finish(&self, handle: WorkHandle, step: Step) -> StratusResult<()> {
        let vm_id = handle.vm_id();
        let result = self.record_step(&handle.item, step);
        drop(handle);
        self.release_lock_entry(vm_id);
        result
    }

    /// Lock a VM for recovery. The item itself is resolved with
    /// [`finish_recovered`](Self::finish_recovered).
    pub async fn lock_vm(&self, vm_id: VmId) -> StratusResult<VmLockGuard> {
        let guard = self.acquire(vm_id).await?;
        Ok(VmLockGuard { _guard: guard })
    }

    /// Close a recovered item. Returns `false` when the item had already
    /// left `Started`, so a resolution is recorded at most once.
    pub fn finish_recovered(&self, item: &WorkItem, step: Step) -> StratusResult<bool> {
        let id = item.id.to_string();
        let write_txn = self.database.begin_write()?;
        let recorded = {
            let mut work = write_txn.open_table(WORK_TABLE)?;
            let current = work
                .get(id.as_str())?
                .map(|data| bincode::deserialize::<WorkItem>(data.value()))
                .transpose()?;
            match current {
                Some(mut current) if current.step == Step::Started => {
                    current.step = step;
                    current.updated_at = Utc::now();
                    let serialized = bincode::serialize(&current)?;
                    work.insert(id.as_str(), serialized.as_slice())?;

                    let mut active = write_txn.open_table(ACTIVE_WORK_TABLE)?;
                    let owns_slot = active
                        .get(current.vm_id.0)?
                        .map(|slot| slot.value() == id.as_str())
                        .unwrap_or(false);
                    if owns_slot {
                        active.remove(current.vm_id.0)?;
                    }
                    true
                }
                _ => false,
            }
        };

        if !recorded {
            write_txn.abort()?;
            return Ok(false);
        }
        write_txn.commit()?;
        info!("Recovered work {} for VM {} closed as {:?}", item.id, item.vm_id, step);
        Ok(true)
    }

    /// Attach the migration an operation is about to dispatch, so the
    /// recovery scan can probe both hosts if the outcome is lost.
    pub fn record_plan(&self, handle: &WorkHandle, plan: &MigrationPlan) -> StratusResult<()> {
        let id = handle.item.id.to_string();
        let write_txn = self.database.begin_write()?;
        {
            let mut work = write_txn.open_table(WORK_TABLE)?;
            let stored = work
                .get(id.as_str())?
                .map(|data| bincode::deserialize::<WorkItem>(data.value()))
                .transpose()?;
            let mut item = stored.unwrap_or_else(|| handle.item.clone());
            item.plan = Some(plan.clone());
            item.updated_at = Utc::now();
            let serialized = bincode::serialize(&item)?;
            work.insert(id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;

        debug!(
            "Work {} for VM {} now tracks migration {} -> {}",
            handle.item.id, handle.item.vm_id, plan.source_host_id, plan.destination_host_id
        );
        Ok(())
    }

    fn record_step(&self, item: &WorkItem, step: Step) -> StratusResult<()> {
        let id = item.id.to_string();

        let write_txn = self.database.begin_write()?;
        let updated = {
            let mut work = write_txn.open_table(WORK_TABLE)?;
            // The stored copy may carry a plan recorded after begin_work
            let stored = work
                .get(id.as_str())?
                .map(|data| bincode::deserialize::<WorkItem>(data.value()))
                .transpose()?;
            let mut updated = stored.unwrap_or_else(|| item.clone());
            updated.step = step;
            updated.updated_at = Utc::now();
            let serialized = bincode::serialize(&updated)?;
            work.insert(id.as_str(), serialized.as_slice())?;

            let mut active = write_txn.open_table(ACTIVE_WORK_TABLE)?;
            let owns_slot = active
                .get(updated.vm_id.0)?
                .map(|current| current.value() == id.as_str())
                .unwrap_or(false);
            if owns_slot {
                active.remove(updated.vm_id.0)?;
            }
            updated
        };
        write_txn.commit()?;

        debug!(
            "Work {} for VM {} moved to {:?}",
            updated.id, updated.vm_id, step
        );
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> StratusResult<Option<WorkItem>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(WORK_TABLE)?;
        let key = id.to_string();
        match table.get(key.as_str())? {
            Some(data) => Ok(Some(bincode::deserialize(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> StratusResult<Vec<WorkItem>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(WORK_TABLE)?;

        let mut items = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            items.push(bincode::deserialize::<WorkItem>(value.value())?);
        }
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    /// `Started` items owned by `owner`, oldest first.
    pub fn list_started(&self, owner: NodeId) -> StratusResult<Vec<WorkItem>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|item| item.owner_node_id == owner && item.step == Step::Started)
            .collect())
    }

    async fn acquire(&self, vm_id: VmId) -> StratusResult<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(vm_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.lock_wait, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!("Lock wait for VM {} exceeded {:?}", vm_id, self.lock_wait);
                Err(StratusError::conflict(
                    vm_id,
                    format!("another operation holds the VM lock after {:?}", self.lock_wait),
                ))
            }
        }
    }

    fn release_lock_entry(&self, vm_id: VmId) {
        self.locks
            .remove_if(&vm_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::init_database_tables;
    use crate::types::HostId;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn create_ledger() -> (TempDir, WorkLedger) {
        let temp_dir = TempDir::new().unwrap();
        let database = Arc::new(Database::create(temp_dir.path().join("work.db")).unwrap());
        init_database_tables(&database).unwrap();
        (
            temp_dir,
            WorkLedger::new(database, NodeId(1), Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn test_second_begin_conflicts_while_held() {
        let (_dir, ledger) = create_ledger();

        let handle = ledger
            .begin_work(VmId(1), OperationType::Stop, None)
            .await
            .unwrap();
        let err = ledger
            .begin_work(VmId(1), OperationType::Start, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

        // Other VMs are independent
        let other = ledger
            .begin_work(VmId(2), OperationType::Start, None)
            .await
            .unwrap();

        ledger.complete_work(handle).unwrap();
        ledger.complete_work(other).unwrap();

        let again = ledger
            .begin_work(VmId(1), OperationType::Start, None)
            .await
            .unwrap();
        ledger.fail_work(again).unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_abandoned_item_blocks_until_recovered() {
        let (_dir, ledger) = create_ledger();

        let handle = ledger
            .begin_work(VmId(9), OperationType::Migrate, None)
            .await
            .unwrap();
        let item = handle.item().clone();
        ledger.abandon(handle);
        assert!(logs_contain("to the recovery scan"));

        let err = ledger
            .begin_work(VmId(9), OperationType::Stop, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert_eq!(ledger.list_started(NodeId(1)).unwrap().len(), 1);

        let _lock = ledger.lock_vm(VmId(9)).await.unwrap();
        assert!(ledger.finish_recovered(&item, Step::Done).unwrap());
        assert!(!ledger.finish_recovered(&item, Step::Done).unwrap());
        assert!(ledger.list_started(NodeId(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recorded_plan_survives_step_change() {
        let (_dir, ledger) = create_ledger();

        let handle = ledger
            .begin_work(VmId(4), OperationType::Scale, None)
            .await
            .unwrap();
        let id = handle.id();
        let plan = MigrationPlan {
            vm_id: VmId(4),
            source_host_id: HostId(5),
            destination_host_id: HostId(6),
            volume_to_pool: Default::default(),
            cross_cluster: false,
        };
        ledger.record_plan(&handle, &plan).unwrap();
        assert_eq!(ledger.get(id).unwrap().unwrap().plan, Some(plan.clone()));

        ledger.fail_work(handle).unwrap();
        let item = ledger.get(id).unwrap().unwrap();
        assert_eq!(item.step, Step::Error);
        assert_eq!(item.plan, Some(plan));
    }

    #[tokio::test]
    async fn test_failed_items_are_retained() {
        let (_dir, ledger) = create_ledger();

        let handle = ledger
            .begin_work(VmId(3), OperationType::Scale, None)
            .await
            .unwrap();
        let id = handle.id();
        ledger.fail_work(handle).unwrap();

        let item = ledger.get(id).unwrap().unwrap();
        assert_eq!(item.step, Step::Error);
        assert_eq!(ledger.list().unwrap().len(), 1);
        assert!(ledger.locks.is_empty());
    }
}
