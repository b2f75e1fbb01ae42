use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    error::{StratusError, StratusResult},
    storage::{HOST_TABLE, STORAGE_POOL_TABLE, VOLUME_TABLE},
    types::{HostId, HostRecord, PoolId, StoragePoolRecord, VmId, VolumeId, VolumeRecord},
};

/// Pool and path rewrite for one migrated volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMigration {
    pub volume_id: VolumeId,
    pub destination_pool: PoolId,
    /// New path reported by the host; `None` keeps the current path
    pub path: Option<String>,
}

/// Hosts, storage pools and volumes the orchestrator reads to check
/// migration preconditions.
pub struct Inventory {
    database: Arc<Database>,
}

impl Inventory {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    pub fn put_host(&self, host: &HostRecord) -> StratusResult<()> {
        self.put(HOST_TABLE, host.id.0, host)
    }

    pub fn get_host(&self, host_id: HostId) -> StratusResult<Option<HostRecord>> {
        self.get(HOST_TABLE, host_id.0)
    }

    pub fn load_host(&self, host_id: HostId) -> StratusResult<HostRecord> {
        self.get_host(host_id)?.ok_or_else(|| StratusError::NotFound {
            resource: format!("host {}", host_id),
        })
    }

    pub fn list_hosts(&self) -> StratusResult<Vec<HostRecord>> {
        self.list(HOST_TABLE)
    }

    pub fn put_pool(&self, pool: &StoragePoolRecord) -> StratusResult<()> {
        self.put(STORAGE_POOL_TABLE, pool.id.0, pool)
    }

    pub fn get_pool(&self, pool_id: PoolId) -> StratusResult<Option<StoragePoolRecord>> {
        self.get(STORAGE_POOL_TABLE, pool_id.0)
    }

    pub fn load_pool(&self, pool_id: PoolId) -> StratusResult<StoragePoolRecord> {
        self.get_pool(pool_id)?.ok_or_else(|| StratusError::NotFound {
            resource: format!("storage pool {}", pool_id),
        })
    }

    pub fn put_volume(&self, volume: &VolumeRecord) -> StratusResult<()> {
        self.put(VOLUME_TABLE, volume.id.0, volume)
    }

    pub fn get_volume(&self, volume_id: VolumeId) -> StratusResult<Option<VolumeRecord>> {
        self.get(VOLUME_TABLE, volume_id.0)
    }

    pub fn volumes_for_vm(&self, vm_id: VmId) -> StratusResult<Vec<VolumeRecord>> {
        Ok(self
            .list::<VolumeRecord>(VOLUME_TABLE)?
            .into_iter()
            .filter(|v| v.vm_id == Some(vm_id))
            .collect())
    }

    /// Rewrite pool, last pool, path and folder of every migrated volume in
    /// one transaction.
    pub fn apply_volume_migrations(&self, migrations: &[VolumeMigration]) -> StratusResult<()> {
        let write_txn = self.database.begin_write()?;
        {
            let pools = write_txn.open_table(STORAGE_POOL_TABLE)?;
            let mut volumes = write_txn.open_table(VOLUME_TABLE)?;

            for migration in migrations {
                let pool_bytes = pools
                    .get(migration.destination_pool.0)?
                    .map(|data| data.value().to_vec());
                let pool: StoragePoolRecord = match pool_bytes {
                    Some(bytes) => bincode::deserialize(&bytes)?,
                    None => {
                        return Err(StratusError::NotFound {
                            resource: format!("storage pool {}", migration.destination_pool),
                        })
                    }
                };

                let volume_bytes = volumes
                    .get(migration.volume_id.0)?
                    .map(|data| data.value().to_vec());
                let mut volume: VolumeRecord = match volume_bytes {
                    Some(bytes) => bincode::deserialize(&bytes)?,
                    None => {
                        return Err(StratusError::NotFound {
                            resource: format!("volume {}", migration.volume_id),
                        })
                    }
                };

                if volume.pool_id != migration.destination_pool {
                    volume.last_pool_id = Some(volume.pool_id);
                }
                volume.pool_id = migration.destination_pool;
                volume.folder = Some(pool.path.clone());
                volume.pod_id = pool.pod_id.or(volume.pod_id);
                if let Some(path) = &migration.path {
                    volume.path = path.clone();
                }

                let serialized = bincode::serialize(&volume)?;
                volumes.insert(volume.id.0, serialized.as_slice())?;
                debug!(
                    "Volume {} moved to pool {} (last pool {:?})",
                    volume.id, volume.pool_id, volume.last_pool_id
                );
            }
        }
        write_txn.commit()?;

        info!("Updated {} volume records after migration", migrations.len());
        Ok(())
    }

    fn put<T: Serialize>(
        &self,
        definition: TableDefinition<'static, u64, &'static [u8]>,
        key: u64,
        value: &T,
    ) -> StratusResult<()> {
        let write_txn = self.database.begin_write()?;
        {
            let mut table = write_txn.open_table(definition)?;
            let serialized = bincode::serialize(value)?;
            table.insert(key, serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<'static, u64, &'static [u8]>,
        key: u64,
    ) -> StratusResult<Option<T>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(definition)?;
        match table.get(key)? {
            Some(data) => Ok(Some(bincode::deserialize(data.value())?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<'static, u64, &'static [u8]>,
    ) -> StratusResult<Vec<T>> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(definition)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            items.push(bincode::deserialize(value.value())?);
        }
        Ok(items)
    }
}
