use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    error::{StratusError, StratusResult},
    placement::{CapacityManager, DeploymentPlanner, ExcludeList, PlacementRequest, ResourceAccounting},
    types::{AccountId, ComputeResources, HostId, VmId},
};

/// Where an attempt runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementTarget {
    /// The VM's current host can absorb the delta
    InPlace(HostId),
    /// The VM has to move first
    Migrate { destination: HostId },
}

impl PlacementTarget {
    pub fn host_id(&self) -> HostId {
        match self {
            PlacementTarget::InPlace(host_id) => *host_id,
            PlacementTarget::Migrate { destination } => *destination,
        }
    }
}

/// Inputs of one retry loop run
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub vm_id: VmId,
    pub account_id: AccountId,
    pub current_host: Option<HostId>,
    pub request: PlacementRequest,
    pub delta: ComputeResources,
}

#[derive(Debug)]
pub struct PlacementOutcome<T> {
    pub value: T,
    pub target: PlacementTarget,
    /// Hosts that were tried and failed
    pub excluded: ExcludeList,
    pub attempts: u32,
}

enum Attempt<T> {
    Succeeded(PlacementTarget, T),
    NoCapacity(HostId),
    Failed(HostId, StratusError),
    NoCandidate,
}

/// Drives candidates through an operation with speculative accounting.
///
/// One attempt tries the VM's current host first and, when that host lacks
/// capacity, goes straight on to a planner candidate.
///
/// Every attempt increments the account's counters before probing the
/// candidate and decrements them again if the attempt does not succeed, so
/// after a successful run exactly one increment remains.
pub struct PlacementRetryLoop {
    planner: Arc<dyn DeploymentPlanner>,
    capacity: Arc<dyn CapacityManager>,
    accounting: Arc<dyn ResourceAccounting>,
    max_retries: u32,
}

impl PlacementRetryLoop {
    pub fn new(
        planner: Arc<dyn DeploymentPlanner>,
        capacity: Arc<dyn CapacityManager>,
        accounting: Arc<dyn ResourceAccounting>,
        max_retries: u32,
    ) -> Self {
        Self {
            planner,
            capacity,
            accounting,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `operation` against successive candidates until one succeeds or
    /// `max_retries` attempts are spent.
    ///
    /// `ResourceUnavailable` is returned when the planner runs out of hosts
    /// or the attempts are exhausted. A `ReconciliationRequired` error from
    /// the operation stops the loop at once, since the VM may have moved.
    pub async fn run<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        mut operation: F,
    ) -> StratusResult<PlacementOutcome<T>>
    where
        F: FnMut(PlacementTarget) -> Fut,
        Fut: Future<Output = StratusResult<T>>,
    {
        let mut excluded = ExcludeList::new();

        for attempt in 1..=self.max_retries {
            self.accounting.increment(ctx.account_id, &ctx.delta).await?;

            match self.attempt(ctx, &mut excluded, &mut operation).await {
                Ok(Attempt::Succeeded(target, value)) => {
                    info!(
                        "Placement for VM {} succeeded on {:?} after {} attempt(s)",
                        ctx.vm_id, target, attempt
                    );
                    return Ok(PlacementOutcome {
                        value,
                        target,
                        excluded,
                        attempts: attempt,
                    });
                }
                Ok(Attempt::NoCapacity(host_id)) => {
                    debug!(
                        "Host {} lacks capacity for VM {} (attempt {}/{})",
                        host_id, ctx.vm_id, attempt, self.max_retries
                    );
                    excluded.add_host(host_id);
                    self.revert(ctx).await?;
                }
                Ok(Attempt::Failed(host_id, err)) => {
                    self.revert(ctx).await?;
                    if matches!(err, StratusError::ReconciliationRequired { .. }) {
                        return Err(err);
                    }
                    warn!(
                        "Attempt {}/{} for VM {} on host {} failed: {}",
                        attempt, self.max_retries, ctx.vm_id, host_id, err
                    );
                    excluded.add_host(host_id);
                }
                Ok(Attempt::NoCandidate) => {
                    self.revert(ctx).await?;
                    return Err(StratusError::resource_unavailable(
                        "host",
                        format!(
                            "no candidate host for VM {} outside {} excluded",
                            ctx.vm_id,
                            excluded.len()
                        ),
                    ));
                }
                Err(err) => {
                    self.revert(ctx).await?;
                    return Err(err);
                }
            }
        }

        Err(StratusError::resource_unavailable(
            "host",
            format!(
                "placement for VM {} failed after {} attempts",
                ctx.vm_id, self.max_retries
            ),
        ))
    }

    async fn attempt<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        excluded: &mut ExcludeList,
        operation: &mut F,
    ) -> StratusResult<Attempt<T>>
    where
        F: FnMut(PlacementTarget) -> Fut,
        Fut: Future<Output = StratusResult<T>>,
    {
        if let Some(current) = ctx.current_host.filter(|host| !excluded.should_avoid(*host)) {
            if self.capacity.host_has_capacity(current, &ctx.delta).await? {
                let target = PlacementTarget::InPlace(current);
                return match operation(target).await {
                    Ok(value) => Ok(Attempt::Succeeded(target, value)),
                    Err(err) => Ok(Attempt::Failed(current, err)),
                };
            }
            // Same attempt goes on to the planner
            debug!(
                "Current host {} lacks capacity for VM {}, asking the planner",
                current, ctx.vm_id
            );
            excluded.add_host(current);
        }

        let target = match self.planner.select_host(&ctx.request, excluded).await? {
            Some(destination) => PlacementTarget::Migrate { destination },
            None => return Ok(Attempt::NoCandidate),
        };

        let host_id = target.host_id();
        if !self.capacity.host_has_capacity(host_id, &ctx.delta).await? {
            return Ok(Attempt::NoCapacity(host_id));
        }

        match operation(target).await {
            Ok(value) => Ok(Attempt::Succeeded(target, value)),
            Err(err) => Ok(Attempt::Failed(host_id, err)),
        }
    }

    async fn revert(&self, ctx: &RetryContext) -> StratusResult<()> {
        self.accounting
            .decrement(ctx.account_id, &ctx.delta)
            .await
            .map_err(|e| {
                error!(
                    "Failed to revert speculative usage for account {}: {}",
                    ctx.account_id, e
                );
                e
            })
    }
}
