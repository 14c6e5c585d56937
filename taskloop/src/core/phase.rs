//! State → phase dispatch table.

use crate::core::types::{OrchestrationState, Phase};

/// What the run loop does for a classified state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Invoke the agent for this phase.
    Run(Phase),
    /// Stop the loop.
    Stop(Terminal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Success,
    Failure,
}

const TABLE: [(OrchestrationState, Dispatch); 5] = [
    (OrchestrationState::WorkLeft, Dispatch::Run(Phase::Implement)),
    (OrchestrationState::InReview, Dispatch::Run(Phase::Review)),
    (OrchestrationState::Blocked, Dispatch::Run(Phase::Tidy)),
    (OrchestrationState::Done, Dispatch::Stop(Terminal::Success)),
    (
        OrchestrationState::NoProgress,
        Dispatch::Stop(Terminal::Failure),
    ),
];

pub fn dispatch(state: OrchestrationState) -> Dispatch {
    TABLE
        .iter()
        .find(|(candidate, _)| *candidate == state)
        .map(|(_, dispatch)| *dispatch)
        .unwrap_or(Dispatch::Stop(Terminal::Failure))
}

/// Whether a successful run of `phase` is followed by the gate.
pub fn runs_gate(phase: Phase) -> bool {
    phase == Phase::Implement
}
