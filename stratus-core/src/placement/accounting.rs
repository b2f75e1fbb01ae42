use async_trait::async_trait;
use redb::{Database, ReadableTable};
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::StratusResult,
    storage::RESOURCE_COUNT_TABLE,
    types::{AccountId, ComputeResources},
};

/// Per-account cpu / memory counters. Increments may be speculative and
/// reverted by a matching decrement.
#[async_trait]
pub trait ResourceAccounting: Send + Sync {
    async fn increment(&self, account_id: AccountId, delta: &ComputeResources) -> StratusResult<()>;

    async fn decrement(&self, account_id: AccountId, delta: &ComputeResources) -> StratusResult<()>;

    async fn usage(&self, account_id: AccountId) -> StratusResult<ComputeResources>;
}

/// Counters persisted in the resource count table
pub struct PersistentResourceCounter {
    database: Arc<Database>,
}

impl PersistentResourceCounter {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    fn update<F>(&self, account_id: AccountId, apply: F) -> StratusResult<ComputeResources>
    where
        F: FnOnce(&ComputeResources) -> ComputeResources,
    {
        let write_txn = self.database.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(RESOURCE_COUNT_TABLE)?;
            let current = match table.get(account_id.0)? {
                Some(data) => bincode::deserialize::<ComputeResources>(data.value())?,
                None => ComputeResources::default(),
            };
            let updated = apply(&current);
            let serialized = bincode::serialize(&updated)?;
            table.insert(account_id.0, serialized.as_slice())?;
            updated
        };
        write_txn.commit()?;
        Ok(updated)
    }
}

#[async_trait]
impl ResourceAccounting for PersistentResourceCounter {
    async fn increment(&self, account_id: AccountId, delta: &ComputeResources) -> StratusResult<()> {
        let updated = self.update(account_id, |current| current.saturating_add(delta))?;
        debug!("Account {} usage raised to {:?}", account_id, updated);
        Ok(())
    }

    async fn decrement(&self, account_id: AccountId, delta: &ComputeResources) -> StratusResult<()> {
        let updated = self.update(account_id, |current| current.saturating_sub(delta))?;
        debug!("Account {} usage lowered to {:?}", account_id, updated);
        Ok(())
    }

    async fn usage(&self, account_id: AccountId) -> StratusResult<ComputeResources> {
        let read_txn = self.database.begin_read()?;
        let table = read_txn.open_table(RESOURCE_COUNT_TABLE)?;
        match table.get(account_id.0)? {
            Some(data) => Ok(bincode::deserialize(data.value())?),
            None => Ok(ComputeResources::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_database_tables;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_increment_then_revert() {
        let temp_dir = TempDir::new().unwrap();
        let database = Arc::new(Database::create(temp_dir.path().join("acct.db")).unwrap());
        init_database_tables(&database).unwrap();
        let counter = PersistentResourceCounter::new(database);

        let delta = ComputeResources::new(2, 1024);
        counter.increment(AccountId(7), &delta).await.unwrap();
        counter.increment(AccountId(7), &delta).await.unwrap();
        counter.decrement(AccountId(7), &delta).await.unwrap();

        assert_eq!(counter.usage(AccountId(7)).await.unwrap(), delta);
        assert_eq!(
            counter.usage(AccountId(8)).await.unwrap(),
            ComputeResources::default()
        );
    }
}
