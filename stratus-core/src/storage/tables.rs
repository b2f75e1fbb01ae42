use redb::{Database, TableDefinition};
use std::sync::Arc;

use crate::error::StratusResult;

// VM lifecycle tables
pub const VM_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("vm_instances");

// Work ledger tables
pub const WORK_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("work_items");
/// vm id -> id of the work item currently `Started` for it
pub const ACTIVE_WORK_TABLE: TableDefinition<u64, &str> = TableDefinition::new("active_work");

// Inventory tables
pub const HOST_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("hosts");
pub const STORAGE_POOL_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("storage_pools");
pub const VOLUME_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("volumes");

// Resource accounting
pub const RESOURCE_COUNT_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("resource_counts");

/// Create every table so read transactions never hit a missing table.
pub fn init_database_tables(database: &Arc<Database>) -> StratusResult<()> {
    let write_txn = database.begin_write()?;
    {
        let _ = write_txn.open_table(VM_TABLE)?;
        let _ = write_txn.open_table(WORK_TABLE)?;
        let _ = write_txn.open_table(ACTIVE_WORK_TABLE)?;
        let _ = write_txn.open_table(HOST_TABLE)?;
        let _ = write_txn.open_table(STORAGE_POOL_TABLE)?;
        let _ = write_txn.open_table(VOLUME_TABLE)?;
        let _ = write_txn.open_table(RESOURCE_COUNT_TABLE)?;
    }
    write_txn.commit()?;
    Ok(())
}
