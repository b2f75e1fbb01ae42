use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::state_table::State;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Durable VM instance id
    VmId
);
id_type!(HostId);
id_type!(ClusterId);
id_type!(PodId);
id_type!(ZoneId);
id_type!(PoolId);
id_type!(VolumeId);
id_type!(AccountId);
id_type!(
    /// Management-process instance id, stamped on work items
    NodeId
);

/// Role classifier used to pick the lifecycle callbacks for a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmType {
    User,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
    InternalLoadBalancer,
}

impl VmType {
    pub const ALL: [VmType; 5] = [
        VmType::User,
        VmType::DomainRouter,
        VmType::ConsoleProxy,
        VmType::SecondaryStorageVm,
        VmType::InternalLoadBalancer,
    ];

    pub fn is_system(self) -> bool {
        !matches!(self, VmType::User)
    }
}

/// CPU and memory allocation of a VM, also used as a resource delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComputeResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

impl ComputeResources {
    pub fn new(cpu_cores: u32, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
        }
    }

    /// Growth from `self` to `target`, or `None` when `target` shrinks any
    /// dimension or does not grow at all.
    pub fn scale_up_delta(&self, target: &ComputeResources) -> Option<ComputeResources> {
        if target.cpu_cores < self.cpu_cores || target.memory_mb < self.memory_mb {
            return None;
        }
        let delta = ComputeResources {
            cpu_cores: target.cpu_cores - self.cpu_cores,
            memory_mb: target.memory_mb - self.memory_mb,
        };
        if delta.is_zero() {
            None
        } else {
            Some(delta)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0 && self.memory_mb == 0
    }

    pub fn saturating_add(&self, other: &ComputeResources) -> ComputeResources {
        ComputeResources {
            cpu_cores: self.cpu_cores.saturating_add(other.cpu_cores),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
        }
    }

    pub fn saturating_sub(&self, other: &ComputeResources) -> ComputeResources {
        ComputeResources {
            cpu_cores: self.cpu_cores.saturating_sub(other.cpu_cores),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
        }
    }
}

/// Durable record of a VM instance.
///
/// `state`, `host_id`, `last_host_id` and `update_count` are only ever
/// written through the state machine's conditional update. The remaining
/// fields belong to VM-type specific managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineInstance {
    pub id: VmId,
    /// External-facing opaque token
    pub uuid: String,
    pub name: String,
    pub state: State,
    pub host_id: Option<HostId>,
    pub last_host_id: Option<HostId>,
    /// Optimistic-lock version, bumped by every accepted transition
    pub update_count: u64,
    pub vm_type: VmType,
    pub dynamically_scalable: bool,
    /// A credential regenerate is owed on next start
    pub update_parameters_pending: bool,
    pub account_id: AccountId,
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    /// Hypervisor capability a host must advertise to run this VM
    pub hypervisor: String,
    pub resources: ComputeResources,
}

impl VirtualMachineInstance {
    /// A freshly registered VM in `Stopped` with no placement history.
    pub fn new(id: VmId, name: impl Into<String>, account_id: AccountId, zone_id: ZoneId) -> Self {
        Self {
            id,
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            state: State::Stopped,
            host_id: None,
            last_host_id: None,
            update_count: 0,
            vm_type: VmType::User,
            dynamically_scalable: false,
            update_parameters_pending: false,
            account_id,
            zone_id,
            pod_id: None,
            hypervisor: "kvm".to_string(),
            resources: ComputeResources::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostStatus {
    Up,
    Down,
    Disconnected,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub name: String,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
    pub cluster_id: ClusterId,
    pub status: HostStatus,
    pub enabled: bool,
    /// Maximum number of guests the hypervisor accepts concurrently
    pub max_guests: u32,
    pub capabilities: Vec<String>,
}

impl HostRecord {
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.status == HostStatus::Up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolScope {
    /// Local disk of a single host
    Host,
    Cluster,
    Zone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePoolRecord {
    pub id: PoolId,
    pub name: String,
    pub scope: PoolScope,
    /// Mount path on the hypervisor, becomes the volume folder
    pub path: String,
    pub pod_id: Option<PodId>,
    pub cluster_id: Option<ClusterId>,
}

impl StoragePoolRecord {
    pub fn is_local(&self) -> bool {
        self.scope == PoolScope::Host
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,
    pub vm_id: Option<VmId>,
    pub name: String,
    pub pool_id: PoolId,
    pub last_pool_id: Option<PoolId>,
    pub path: String,
    pub folder: Option<String>,
    pub pod_id: Option<PodId>,
    /// Disk offering asks for host-local storage
    pub use_local_storage: bool,
}

/// Power state reported by a host agent for one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PowerOn,
    PowerOff,
    Unknown,
}

/// Describes one live migration. Derived per request, persisted only as
/// work-item context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub vm_id: VmId,
    pub source_host_id: HostId,
    pub destination_host_id: HostId,
    /// Empty for compute-only migration
    pub volume_to_pool: BTreeMap<VolumeId, PoolId>,
    pub cross_cluster: bool,
}

impl MigrationPlan {
    pub fn moves_storage(&self) -> bool {
        !self.volume_to_pool.is_empty()
    }
}
