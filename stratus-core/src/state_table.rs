//! Legal VM lifecycle transitions.
//!
//! The table is a `const fn` over `(State, Event)` so the full set of legal
//! pairs is reviewable in one place and enumerable in tests.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Expunging,
    Destroyed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    StartRequested,
    OperationSucceeded,
    OperationFailed,
    StopRequested,
    MigrationRequested,
    DestroyRequested,
    ExpungeRequested,
    AgentReportsRunning,
    AgentReportsStopped,
    RecoveryRequested,
    OperationFailedToError,
}

impl State {
    pub const ALL: [State; 9] = [
        State::Creating,
        State::Starting,
        State::Running,
        State::Stopping,
        State::Stopped,
        State::Migrating,
        State::Expunging,
        State::Destroyed,
        State::Error,
    ];

    /// States in which the VM occupies a host; `host_id` is set exactly then.
    pub const fn holds_host(self) -> bool {
        matches!(
            self,
            State::Starting | State::Running | State::Stopping | State::Migrating
        )
    }

    /// States an operation passes through but never returns control in.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            State::Creating | State::Starting | State::Stopping | State::Migrating
        )
    }
}

impl Event {
    pub const ALL: [Event; 11] = [
        Event::StartRequested,
        Event::OperationSucceeded,
        Event::OperationFailed,
        Event::StopRequested,
        Event::MigrationRequested,
        Event::DestroyRequested,
        Event::ExpungeRequested,
        Event::AgentReportsRunning,
        Event::AgentReportsStopped,
        Event::RecoveryRequested,
        Event::OperationFailedToError,
    ];
}

/// Next state for `(state, event)`, or `None` when the pair is illegal.
pub const fn next_state(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    match (state, event) {
        (Creating, OperationSucceeded) => Some(Stopped),
        (Creating, OperationFailed) => Some(Error),
        (Creating, DestroyRequested) => Some(Destroyed),
        (Creating, AgentReportsStopped) => Some(Stopped),
        (Creating, StartRequested) => Some(Starting),

        (Stopped, StartRequested) => Some(Starting),
        (Stopped, StopRequested) => Some(Stopped),
        (Stopped, DestroyRequested) => Some(Destroyed),
        (Stopped, ExpungeRequested) => Some(Expunging),
        (Stopped, AgentReportsStopped) => Some(Stopped),
        (Stopped, OperationFailed) => Some(Error),

        (Starting, OperationSucceeded) => Some(Running),
        (Starting, OperationFailed) => Some(Stopped),
        (Starting, OperationFailedToError) => Some(Error),
        (Starting, AgentReportsRunning) => Some(Running),
        (Starting, AgentReportsStopped) => Some(Stopped),

        (Running, OperationSucceeded) => Some(Running),
        (Running, StopRequested) => Some(Stopping),
        (Running, MigrationRequested) => Some(Migrating),
        (Running, AgentReportsRunning) => Some(Running),
        (Running, AgentReportsStopped) => Some(Stopped),

        (Migrating, MigrationRequested) => Some(Migrating),
        (Migrating, OperationSucceeded) => Some(Running),
        (Migrating, OperationFailed) => Some(Running),
        (Migrating, OperationFailedToError) => Some(Error),
        (Migrating, AgentReportsRunning) => Some(Running),
        (Migrating, AgentReportsStopped) => Some(Stopped),

        (Stopping, OperationSucceeded) => Some(Stopped),
        (Stopping, OperationFailed) => Some(Running),
        (Stopping, OperationFailedToError) => Some(Error),
        (Stopping, StopRequested) => Some(Stopping),
        (Stopping, AgentReportsRunning) => Some(Running),
        (Stopping, AgentReportsStopped) => Some(Stopped),

        (Destroyed, RecoveryRequested) => Some(Stopped),
        (Destroyed, ExpungeRequested) => Some(Expunging),

        (Expunging, OperationFailed) => Some(Expunging),
        (Expunging, ExpungeRequested) => Some(Expunging),

        (Error, DestroyRequested) => Some(Expunging),
        (Error, ExpungeRequested) => Some(Expunging),

        _ => None,
    }
}

pub const fn is_legal(state: State, event: Event) -> bool {
    next_state(state, event).is_some()
}

const_assert!(is_legal(State::Running, Event::MigrationRequested));
const_assert!(is_legal(State::Migrating, Event::OperationSucceeded));
const_assert!(!is_legal(State::Stopped, Event::MigrationRequested));
const_assert!(!is_legal(State::Expunging, Event::StartRequested));
const_assert!(!State::Stopped.holds_host());
const_assert!(State::Migrating.holds_host());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_reports_land_on_stable_states() {
        for state in State::ALL {
            if let Some(next) = next_state(state, Event::AgentReportsRunning) {
                assert_eq!(next, State::Running);
            }
            if let Some(next) = next_state(state, Event::AgentReportsStopped) {
                assert_eq!(next, State::Stopped);
            }
        }
    }

    #[test]
    fn every_transient_state_has_an_exit() {
        for state in State::ALL.into_iter().filter(|s| s.is_transient()) {
            let exits = Event::ALL
                .into_iter()
                .filter_map(|e| next_state(state, e))
                .filter(|next| *next != state)
                .count();
            assert!(exits > 0, "{:?} has no exit", state);
        }
    }

    #[test]
    fn expunging_only_loops() {
        for event in Event::ALL {
            if let Some(next) = next_state(State::Expunging, event) {
                assert_eq!(next, State::Expunging);
            }
        }
    }

    #[test]
    fn legal_pair_count() {
        let legal = State::ALL
            .into_iter()
            .flat_map(|s| Event::ALL.into_iter().map(move |e| (s, e)))
            .filter(|(s, e)| is_legal(*s, *e))
            .count();
        assert_eq!(legal, 39);
    }
}
