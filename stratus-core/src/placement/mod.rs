//! Host placement
//!
//! Candidate ranking belongs to an external [`DeploymentPlanner`]; this
//! module owns the exclusion set, capacity probing and the bounded retry
//! loop that drives candidates through an operation.

pub mod accounting;
pub mod retry_loop;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::{
    error::StratusResult,
    types::{ClusterId, ComputeResources, HostId, PodId, ZoneId},
};

pub use accounting::{PersistentResourceCounter, ResourceAccounting};
pub use retry_loop::{PlacementOutcome, PlacementRetryLoop, PlacementTarget, RetryContext};

/// What a candidate host must satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    pub cluster_id: Option<ClusterId>,
    pub required_capability: String,
    /// Offered first when the planner can honor it
    pub preferred_host: Option<HostId>,
}

/// Hosts a placement attempt must not return again
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeList {
    hosts: BTreeSet<HostId>,
}

impl ExcludeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the host was already excluded.
    pub fn add_host(&mut self, host_id: HostId) -> bool {
        self.hosts.insert(host_id)
    }

    pub fn should_avoid(&self, host_id: HostId) -> bool {
        self.hosts.contains(&host_id)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.iter().copied()
    }
}

/// Ranks candidate hosts. `Ok(None)` means no host is available.
#[async_trait]
pub trait DeploymentPlanner: Send + Sync {
    async fn select_host(
        &self,
        request: &PlacementRequest,
        exclude: &ExcludeList,
    ) -> StratusResult<Option<HostId>>;
}

/// Capability and capacity probe for a single host
#[async_trait]
pub trait CapacityManager: Send + Sync {
    async fn host_has_capacity(
        &self,
        host_id: HostId,
        delta: &ComputeResources,
    ) -> StratusResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_list_dedups() {
        let mut exclude = ExcludeList::new();
        assert!(exclude.add_host(HostId(5)));
        assert!(!exclude.add_host(HostId(5)));
        assert!(exclude.should_avoid(HostId(5)));
        assert!(!exclude.should_avoid(HostId(6)));
        assert_eq!(exclude.len(), 1);
    }
}
