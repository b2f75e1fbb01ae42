use std::time::Duration;

use thiserror::Error;

use crate::state_table::{Event, State};
use crate::types::{HostId, VmId};

/// Closed set of failure kinds callers branch on.
///
/// Every [`StratusError`] variant maps onto exactly one kind through
/// [`StratusError::kind`]. Call sites decide retry / rollback / reconciliation
/// from the kind, never from the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Event not legal from the current persisted state.
    InvalidStateTransition,
    /// Optimistic-lock mismatch or per-VM lock already held.
    ConcurrencyConflict,
    /// No transport to the host. Outcome of the operation is unknown.
    AgentUnavailable,
    /// No answer within the wait budget. Outcome of the operation is unknown.
    OperationTimeout,
    /// No capacity or no candidate host.
    ResourceUnavailable,
    /// Invariant violated, required data missing, or a host reported a
    /// definite failure.
    RuntimeFault,
}

impl ErrorKind {
    /// Transport outcomes where the command may or may not have taken effect.
    pub fn is_ambiguous(self) -> bool {
        matches!(self, ErrorKind::AgentUnavailable | ErrorKind::OperationTimeout)
    }

    /// The caller may retry the whole operation from a fresh read.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ConcurrencyConflict)
    }
}

#[derive(Error, Debug)]
pub enum StratusError {
    #[error("Invalid state transition for VM {vm_id}: event {event:?} from {actual:?} (expected {expected:?})")]
    InvalidStateTransition {
        vm_id: VmId,
        expected: State,
        actual: State,
        event: Event,
    },

    #[error("VM {vm_id} is {actual:?} but {operation} requires one of {expected:?}")]
    InvalidVmState {
        vm_id: VmId,
        operation: String,
        expected: Vec<State>,
        actual: State,
    },

    #[error("Concurrent operation on VM {vm_id}: {details}")]
    ConcurrencyConflict { vm_id: VmId, details: String },

    #[error("Agent unavailable on host {host_id}: {details}")]
    AgentUnavailable { host_id: HostId, details: String },

    #[error("Operation '{operation}' on host {host_id} timed out after {wait:?}")]
    OperationTimeout {
        host_id: HostId,
        operation: String,
        wait: Duration,
    },

    #[error("Command {command} failed on host {host_id}: {details}")]
    CommandFailed {
        host_id: HostId,
        command: String,
        details: String,
    },

    #[error("Resource unavailable: {resource_type} - {message}")]
    ResourceUnavailable {
        resource_type: String,
        message: String,
    },

    #[error("Runtime fault: {message}")]
    RuntimeFault { message: String },

    #[error("VM {vm_id} needs reconciliation: {details}")]
    ReconciliationRequired { vm_id: VmId, details: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] redb::Error),

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type StratusResult<T> = std::result::Result<T, StratusError>;

impl StratusError {
    /// Classify this error into the closed kind set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StratusError::InvalidStateTransition { .. } | StratusError::InvalidVmState { .. } => {
                ErrorKind::InvalidStateTransition
            }
            StratusError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            StratusError::AgentUnavailable { .. } => ErrorKind::AgentUnavailable,
            StratusError::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            StratusError::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            StratusError::RuntimeFault { .. }
            | StratusError::CommandFailed { .. }
            | StratusError::ReconciliationRequired { .. }
            | StratusError::NotFound { .. }
            | StratusError::ConfigError(_)
            | StratusError::StorageError(_)
            | StratusError::StorageTransactionError(_)
            | StratusError::StorageTableError(_)
            | StratusError::Storage { .. }
            | StratusError::SerializationError(_)
            | StratusError::IoError(_) => ErrorKind::RuntimeFault,
        }
    }

    pub fn runtime_fault(message: impl Into<String>) -> Self {
        StratusError::RuntimeFault {
            message: message.into(),
        }
    }

    pub fn resource_unavailable(resource_type: &str, message: impl Into<String>) -> Self {
        StratusError::ResourceUnavailable {
            resource_type: resource_type.to_string(),
            message: message.into(),
        }
    }

    pub fn conflict(vm_id: VmId, details: impl Into<String>) -> Self {
        StratusError::ConcurrencyConflict {
            vm_id,
            details: details.into(),
        }
    }
}

impl From<redb::TransactionError> for StratusError {
    fn from(err: redb::TransactionError) -> Self {
        StratusError::StorageTransactionError(err.to_string())
    }
}

impl From<redb::TableError> for StratusError {
    fn from(err: redb::TableError) -> Self {
        StratusError::StorageTableError(err.to_string())
    }
}

impl From<redb::StorageError> for StratusError {
    fn from(err: redb::StorageError) -> Self {
        StratusError::StorageError(err.into())
    }
}

impl From<redb::DatabaseError> for StratusError {
    fn from(err: redb::DatabaseError) -> Self {
        StratusError::StorageError(err.into())
    }
}

impl From<redb::CommitError> for StratusError {
    fn from(err: redb::CommitError) -> Self {
        StratusError::StorageError(err.into())
    }
}

impl From<toml::de::Error> for StratusError {
    fn from(err: toml::de::Error) -> Self {
        StratusError::ConfigError(err.to_string())
    }
}

/// Attach the failed storage operation to an error.
pub trait StorageContext<T> {
    fn storage_context(self, operation: &str) -> StratusResult<T>;
}

impl<T, E> StorageContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, operation: &str) -> StratusResult<T> {
        self.map_err(|e| StratusError::Storage {
            operation: operation.to_string(),
            source: Box::new(e),
        })
    }
}
