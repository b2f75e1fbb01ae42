pub mod agent;
pub mod config;
pub mod error;
pub mod failpoints;
pub mod guru;
pub mod orchestrator;
pub mod placement;
pub mod recovery;
pub mod state_machine;
pub mod state_table;
pub mod storage;
pub mod types;
pub mod work_ledger;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::StratusConfig;
pub use error::{ErrorKind, StratusError, StratusResult};
pub use orchestrator::{MigrationRequest, Orchestrator, OrchestratorDeps};
pub use recovery::{RecoveryReport, RecoveryScanner};
pub use state_machine::{StateMachine, TransitionRequest};
pub use state_table::{Event, State};
pub use work_ledger::{OperationType, Step, WorkItem, WorkLedger};
