//! Declared lifecycle graphs.
//!
//! A [`StateGraph`] names the states and transitions of a lifecycle and declares, per
//! transition, exactly which `(from, to)` edges it may take. The transaction engine that enforces
//! the graph lives in `switchyard_runtime::fsm`; this module only holds the data.
//!
//! [`ComponentLifecycle`] is the graph every component endpoint follows:
//!
//! ```text
//! Created -> RegisterPending3 -> RegisterPending2 -> RegisterPending1 -> InitializePending
//!         -> Active -> UnregisterPending3 -> UnregisterPending2 -> UnregisterPending1 -> Destroyed
//!
//! any state --InternalFailure--> Failed
//! ```
//!
//! The three pending steps on each side stand for the three callback handlers (component
//! callbacks, connector and channel resolver) that each acknowledge registration separately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// The result of a transaction computation: the state to commit and the caller's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAndOutput<S, O> {
    /// State to commit
    pub state: S,
    /// Value handed back to the caller
    pub output: O,
}

impl<S, O> StateAndOutput<S, O> {
    /// Pair a state with an output
    #[must_use]
    pub const fn new(state: S, output: O) -> Self {
        Self { state, output }
    }
}

impl<S> StateAndOutput<S, ()> {
    /// A state with no output
    #[must_use]
    pub const fn state(state: S) -> Self {
        Self { state, output: () }
    }
}

/// A lifecycle graph.
pub trait StateGraph: Send + Sync + 'static {
    /// Node type
    type State: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Edge label type
    type Transition: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// State a fresh machine starts in
    const INITIAL: Self::State;

    /// Absorbing failure state
    const FAILED: Self::State;

    /// Transition leading from any state to [`StateGraph::FAILED`]
    const FAILURE: Self::Transition;

    /// Edges `transition` may take
    fn edges(transition: Self::Transition) -> &'static [(Self::State, Self::State)];

    /// States with no outgoing edges except failure handling
    fn is_terminal(state: Self::State) -> bool;

    /// Whether `transition` may fire from `state`
    fn permits(transition: Self::Transition, state: Self::State) -> bool {
        Self::edges(transition).iter().any(|(from, _)| *from == state)
    }

    /// Whether `transition` may move `from` to `to`
    fn declares(transition: Self::Transition, from: Self::State, to: Self::State) -> bool {
        Self::edges(transition)
            .iter()
            .any(|edge| *edge == (from, to))
    }

    /// The single declared target of `transition` from `state`, if exactly one exists
    fn default_target(transition: Self::Transition, state: Self::State) -> Option<Self::State> {
        let mut targets = Self::edges(transition)
            .iter()
            .filter(|(from, _)| *from == state)
            .map(|(_, to)| *to);
        let first = targets.next()?;
        targets.next().is_none().then_some(first)
    }
}

/// Lifecycle states of a component endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsmState {
    /// Constructed, handlers not yet assigned
    Created,
    /// Waiting for three registration acknowledgements
    RegisterPending3,
    /// Waiting for two registration acknowledgements
    RegisterPending2,
    /// Waiting for one registration acknowledgement
    RegisterPending1,
    /// Registered, waiting for the channel to initialize
    InitializePending,
    /// Serving requests
    Active,
    /// Waiting for three unregistration acknowledgements
    UnregisterPending3,
    /// Waiting for two unregistration acknowledgements
    UnregisterPending2,
    /// Waiting for one unregistration acknowledgement
    UnregisterPending1,
    /// Shut down cleanly
    Destroyed,
    /// Shut down after an internal failure
    Failed,
}

impl FsmState {
    /// Every state, in lifecycle order
    pub const ALL: [Self; 11] = [
        Self::Created,
        Self::RegisterPending3,
        Self::RegisterPending2,
        Self::RegisterPending1,
        Self::InitializePending,
        Self::Active,
        Self::UnregisterPending3,
        Self::UnregisterPending2,
        Self::UnregisterPending1,
        Self::Destroyed,
        Self::Failed,
    ];
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle transitions of a component endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsmTransition {
    /// Construction finished
    CreateCompleted,
    /// A handler acknowledged registration
    RegisterCompleted,
    /// The channel initialized the component
    InitializeCompleted,
    /// The peer asked the component to shut down
    ExternalDestroy,
    /// A handler acknowledged unregistration
    UnregisterCompleted,
    /// Something failed; force cleanup
    InternalFailure,
}

impl fmt::Display for FsmTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The component endpoint lifecycle graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentLifecycle;

const CREATE_EDGES: &[(FsmState, FsmState)] = &[(FsmState::Created, FsmState::RegisterPending3)];

const REGISTER_EDGES: &[(FsmState, FsmState)] = &[
    (FsmState::RegisterPending3, FsmState::RegisterPending2),
    (FsmState::RegisterPending2, FsmState::RegisterPending1),
    (FsmState::RegisterPending1, FsmState::InitializePending),
];

const INITIALIZE_EDGES: &[(FsmState, FsmState)] =
    &[(FsmState::InitializePending, FsmState::Active)];

const DESTROY_EDGES: &[(FsmState, FsmState)] = &[
    (FsmState::Active, FsmState::UnregisterPending3),
    (FsmState::InitializePending, FsmState::UnregisterPending3),
];

const UNREGISTER_EDGES: &[(FsmState, FsmState)] = &[
    (FsmState::UnregisterPending3, FsmState::UnregisterPending2),
    (FsmState::UnregisterPending2, FsmState::UnregisterPending1),
    (FsmState::UnregisterPending1, FsmState::Destroyed),
];

const FAILURE_EDGES: &[(FsmState, FsmState)] = &[
    (FsmState::Created, FsmState::Failed),
    (FsmState::RegisterPending3, FsmState::Failed),
    (FsmState::RegisterPending2, FsmState::Failed),
    (FsmState::RegisterPending1, FsmState::Failed),
    (FsmState::InitializePending, FsmState::Failed),
    (FsmState::Active, FsmState::Failed),
    (FsmState::UnregisterPending3, FsmState::Failed),
    (FsmState::UnregisterPending2, FsmState::Failed),
    (FsmState::UnregisterPending1, FsmState::Failed),
    (FsmState::Destroyed, FsmState::Failed),
    (FsmState::Failed, FsmState::Failed),
];

impl StateGraph for ComponentLifecycle {
    type State = FsmState;
    type Transition = FsmTransition;

    const INITIAL: FsmState = FsmState::Created;
    const FAILED: FsmState = FsmState::Failed;
    const FAILURE: FsmTransition = FsmTransition::InternalFailure;

    fn edges(transition: FsmTransition) -> &'static [(FsmState, FsmState)] {
        match transition {
            FsmTransition::CreateCompleted => CREATE_EDGES,
            FsmTransition::RegisterCompleted => REGISTER_EDGES,
            FsmTransition::InitializeCompleted => INITIALIZE_EDGES,
            FsmTransition::ExternalDestroy => DESTROY_EDGES,
            FsmTransition::UnregisterCompleted => UNREGISTER_EDGES,
            FsmTransition::InternalFailure => FAILURE_EDGES,
        }
    }

    fn is_terminal(state: FsmState) -> bool {
        matches!(state, FsmState::Destroyed | FsmState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSITIONS: [FsmTransition; 6] = [
        FsmTransition::CreateCompleted,
        FsmTransition::RegisterCompleted,
        FsmTransition::InitializeCompleted,
        FsmTransition::ExternalDestroy,
        FsmTransition::UnregisterCompleted,
        FsmTransition::InternalFailure,
    ];

    #[test]
    fn test_failure_is_declared_from_every_state() {
        for state in FsmState::ALL {
            assert!(ComponentLifecycle::declares(
                FsmTransition::InternalFailure,
                state,
                FsmState::Failed
            ));
        }
    }

    #[test]
    fn test_destroyed_only_permits_failure() {
        for transition in TRANSITIONS {
            let permitted = ComponentLifecycle::permits(transition, FsmState::Destroyed);
            assert_eq!(permitted, transition == FsmTransition::InternalFailure);
        }
    }

    #[test]
    fn test_terminal_states_permit_nothing_but_failure() {
        let terminal: Vec<_> = FsmState::ALL
            .into_iter()
            .filter(|state| ComponentLifecycle::is_terminal(*state))
            .collect();
        assert_eq!(terminal, vec![FsmState::Destroyed, FsmState::Failed]);

        for state in terminal {
            for transition in TRANSITIONS {
                if transition != FsmTransition::InternalFailure {
                    assert!(!ComponentLifecycle::permits(transition, state), "{transition} from {state}");
                }
            }
        }
    }

    #[test]
    fn test_registration_steps_walk_down_to_initialize_pending() {
        let mut state = FsmState::RegisterPending3;
        for _ in 0..3 {
            state = ComponentLifecycle::default_target(FsmTransition::RegisterCompleted, state)
                .unwrap_or(FsmState::Failed);
        }
        assert_eq!(state, FsmState::InitializePending);
    }

    #[test]
    fn test_skipping_a_registration_step_is_undeclared() {
        assert!(!ComponentLifecycle::declares(
            FsmTransition::RegisterCompleted,
            FsmState::RegisterPending3,
            FsmState::InitializePending
        ));
    }

    #[test]
    fn test_every_non_failure_edge_targets_a_later_state() {
        let position = |state| FsmState::ALL.iter().position(|s| *s == state);
        for transition in TRANSITIONS {
            if transition == FsmTransition::InternalFailure {
                continue;
            }
            for (from, to) in ComponentLifecycle::edges(transition) {
                assert!(position(*from) < position(*to), "{transition}: {from} -> {to}");
            }
        }
    }
}
