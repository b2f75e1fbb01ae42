//! Command / answer envelope and the typed command bodies carried in it.
//!
//! The envelope payload is opaque bytes. Typed commands encode themselves
//! with bincode and name their answer type, so the host-side executor and
//! the orchestrator agree on the layout without the dispatcher knowing it.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::StratusResult,
    types::{ComputeResources, HostId, PoolId, PowerState, VmId, VolumeId},
};

/// Request sent to one host agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target_host_id: HostId,
    pub kind: String,
    pub payload: Bytes,
    pub wait: Duration,
}

/// Reply from a host agent. Transport failures never appear here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub succeeded: bool,
    pub details: String,
    pub payload: Bytes,
}

impl Answer {
    pub fn success(payload: Bytes) -> Self {
        Self {
            succeeded: true,
            details: String::new(),
            payload,
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            details: details.into(),
            payload: Bytes::new(),
        }
    }

    /// Successful answer carrying a typed body.
    pub fn with_body<T: Serialize>(body: &T) -> StratusResult<Self> {
        Ok(Self::success(Bytes::from(bincode::serialize(body)?)))
    }
}

/// A typed command body with a known kind and answer layout.
pub trait AgentCommand: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;
    type Answer: Serialize + DeserializeOwned + Send;

    fn encode(&self) -> StratusResult<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    fn decode_answer(payload: &[u8]) -> StratusResult<Self::Answer> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Final location of one volume as reported by a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePath {
    pub volume_id: VolumeId,
    pub path: String,
}

/// Destination pool of one volume, with the pool's mount path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTarget {
    pub volume_id: VolumeId,
    pub volume_path: String,
    pub pool_id: PoolId,
    pub pool_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCommand {
    pub vm_id: VmId,
    pub vm_uuid: String,
    pub resources: ComputeResources,
    /// Regenerate guest credentials during boot
    pub regenerate_credentials: bool,
}

impl AgentCommand for StartCommand {
    const KIND: &'static str = "StartCommand";
    type Answer = ();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub vm_id: VmId,
    pub vm_uuid: String,
    pub force: bool,
}

impl AgentCommand for StopCommand {
    const KIND: &'static str = "StopCommand";
    type Answer = ();
}

/// Status probe used to reconcile ambiguous outcomes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVmStateCommand {
    pub vm_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVmStateAnswer {
    pub power_state: PowerState,
}

impl AgentCommand for CheckVmStateCommand {
    const KIND: &'static str = "CheckVmStateCommand";
    type Answer = CheckVmStateAnswer;
}

/// Compute-only live migration, sent to the source host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateCommand {
    pub vm_uuid: String,
    pub destination_host_id: HostId,
}

impl AgentCommand for MigrateCommand {
    const KIND: &'static str = "MigrateCommand";
    type Answer = ();
}

/// Storage and compute migration inside one cluster, sent to the
/// destination host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageCommand {
    pub vm_uuid: String,
    pub source_host_id: HostId,
    pub volumes: Vec<VolumeTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageAnswer {
    pub volumes: Vec<VolumePath>,
}

impl AgentCommand for MigrateWithStorageCommand {
    const KIND: &'static str = "MigrateWithStorageCommand";
    type Answer = MigrateWithStorageAnswer;
}

/// Phase 1 of cross-cluster migration, sent to the destination host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageReceiveCommand {
    pub vm_uuid: String,
    pub volumes: Vec<VolumeTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageReceiveAnswer {
    /// Rendezvous key for the send phase
    pub token: String,
    pub volume_to_storage: Vec<(VolumeId, String)>,
    pub nic_to_network: Vec<(String, String)>,
}

impl AgentCommand for MigrateWithStorageReceiveCommand {
    const KIND: &'static str = "MigrateWithStorageReceiveCommand";
    type Answer = MigrateWithStorageReceiveAnswer;
}

/// Phase 2, sent to the source host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageSendCommand {
    pub vm_uuid: String,
    pub destination_host_id: HostId,
    pub token: String,
    pub volume_to_storage: Vec<(VolumeId, String)>,
    pub nic_to_network: Vec<(String, String)>,
}

impl AgentCommand for MigrateWithStorageSendCommand {
    const KIND: &'static str = "MigrateWithStorageSendCommand";
    type Answer = ();
}

/// Phase 3, sent to the destination host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageCompleteCommand {
    pub vm_uuid: String,
    pub volumes: Vec<VolumeTarget>,
}

impl AgentCommand for MigrateWithStorageCompleteCommand {
    const KIND: &'static str = "MigrateWithStorageCompleteCommand";
    type Answer = MigrateWithStorageAnswer;
}

/// Tear down the destination placeholder left by a failed send phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateWithStorageCleanupCommand {
    pub vm_uuid: String,
    pub token: String,
}

impl AgentCommand for MigrateWithStorageCleanupCommand {
    const KIND: &'static str = "MigrateWithStorageCleanupCommand";
    type Answer = ();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleVmCommand {
    pub vm_uuid: String,
    pub resources: ComputeResources,
}

impl AgentCommand for ScaleVmCommand {
    const KIND: &'static str = "ScaleVmCommand";
    type Answer = ();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_answers_decode_from_empty_payload() {
        assert!(StopCommand::decode_answer(&[]).is_ok());
    }

    #[test]
    fn typed_answer_survives_envelope() {
        let answer = Answer::with_body(&CheckVmStateAnswer {
            power_state: PowerState::PowerOn,
        })
        .unwrap();
        let decoded = CheckVmStateCommand::decode_answer(&answer.payload).unwrap();
        assert_eq!(decoded.power_state, PowerState::PowerOn);
    }
}
