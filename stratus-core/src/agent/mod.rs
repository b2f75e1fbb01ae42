//! Host agent communication
//!
//! Commands travel to a host as an opaque [`Command`] envelope and come back
//! as an [`Answer`]; transport failures are reported as errors instead.

pub mod command;
pub mod dispatcher;

pub use command::{AgentCommand, Answer, Command};
pub use dispatcher::{AgentDispatcher, AgentManager, AgentRequest, AgentSession};

use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    error::{StratusError, StratusResult},
    types::{HostId, PowerState},
};
use command::CheckVmStateCommand;

/// Send a typed command and decode its answer.
///
/// A definite failure reported by the host becomes
/// `StratusError::CommandFailed`; transport failures pass through unchanged.
pub async fn send_typed<C: AgentCommand>(
    dispatcher: &dyn AgentDispatcher,
    host_id: HostId,
    body: &C,
    wait: Duration,
) -> StratusResult<C::Answer> {
    let command = Command {
        target_host_id: host_id,
        kind: C::KIND.to_string(),
        payload: body.encode()?,
        wait,
    };

    let answer = dispatcher.send(command).await?;
    if !answer.succeeded {
        return Err(StratusError::CommandFailed {
            host_id,
            command: C::KIND.to_string(),
            details: answer.details,
        });
    }

    C::decode_answer(&answer.payload).map_err(|e| {
        warn!("Undecodable {} answer from host {}: {}", C::KIND, host_id, e);
        StratusError::runtime_fault(format!(
            "undecodable {} answer from host {}",
            C::KIND,
            host_id
        ))
    })
}

/// Ask `host_id` for the power state of a VM.
///
/// Transport failures are returned as errors so the caller can tell "the
/// host does not know" (`PowerState::Unknown`) from "the host did not answer".
/// A definite failure answer means the host does not run the VM.
pub async fn probe_power_state(
    dispatcher: &dyn AgentDispatcher,
    host_id: HostId,
    vm_uuid: &str,
    wait: Duration,
) -> StratusResult<PowerState> {
    let probe = CheckVmStateCommand {
        vm_uuid: vm_uuid.to_string(),
    };
    match send_typed(dispatcher, host_id, &probe, wait).await {
        Ok(answer) => {
            debug!(
                "Host {} reports {:?} for VM {}",
                host_id, answer.power_state, vm_uuid
            );
            Ok(answer.power_state)
        }
        Err(StratusError::CommandFailed { details, .. }) => {
            debug!(
                "Host {} does not know VM {}: {}",
                host_id, vm_uuid, details
            );
            Ok(PowerState::PowerOff)
        }
        Err(e) => Err(e),
    }
}
