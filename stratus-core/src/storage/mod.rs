//! Storage layer modules
//!
//! Durable tables for VM records, the work ledger, the host / pool / volume
//! inventory and resource counters, all in one redb database.

pub mod inventory;
pub mod tables;
pub mod vm_store;

use redb::Database;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use inventory::{Inventory, VolumeMigration};
pub use tables::{
    init_database_tables, ACTIVE_WORK_TABLE, HOST_TABLE, RESOURCE_COUNT_TABLE, STORAGE_POOL_TABLE,
    VM_TABLE, VOLUME_TABLE, WORK_TABLE,
};
pub use vm_store::{StateUpdate, VmRecordStore};

use crate::error::{StorageContext, StratusResult};

/// Open (or create) the database file and make sure every table exists.
pub fn open_database(path: impl AsRef<Path>) -> StratusResult<Arc<Database>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let database = Arc::new(Database::create(path).storage_context("create database")?);
    init_database_tables(&database)?;
    info!("Opened database at {}", path.display());
    Ok(database)
}

/// Open an existing database file without creating tables.
pub fn open_existing_database(path: impl AsRef<Path>) -> StratusResult<Arc<Database>> {
    let database = Database::open(path.as_ref()).storage_context("open database")?;
    Ok(Arc::new(database))
}
