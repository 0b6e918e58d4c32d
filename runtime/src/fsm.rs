//! Transactional state machine over a declared [`StateGraph`].
//!
//! A transaction captures the current state under the machine's lock, checks that the
//! transition may fire from it, runs the caller's computation, checks that the computed target is
//! one the transition declares, and commits. No two transactions interleave.
//!
//! The machine never runs side effects that might re-enter it: callers return whatever follow-up
//! work they need as the transaction output and run it after the commit.

use crate::metrics::FsmMetrics;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use switchyard_core::lifecycle::{StateAndOutput, StateGraph};
use thiserror::Error;

/// Rejected or aborted transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    /// The transition has no edge leaving the current state
    #[error("transition {transition} is not allowed from state {state}")]
    IllegalTransition {
        /// The attempted transition
        transition: String,
        /// State at the time of the attempt
        state: String,
    },

    /// The computation picked a target the transition does not declare
    #[error("transition {transition} cannot move {from} to {to}")]
    UndeclaredTarget {
        /// The attempted transition
        transition: String,
        /// Source state
        from: String,
        /// Computed target
        to: String,
    },

    /// The machine is already failed; the computation did not run
    #[error("transition {transition} ignored: already failed")]
    AlreadyFailed {
        /// The attempted transition
        transition: String,
    },

    /// The computation returned an error; the machine is now failed
    #[error("transition {transition} aborted: {reason}")]
    Aborted {
        /// The attempted transition
        transition: String,
        /// Error raised by the computation
        reason: String,
    },
}

impl FsmError {
    /// Whether this error moved the machine into its failed state
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::UndeclaredTarget { .. })
    }

    /// The transition that was attempted
    #[must_use]
    pub fn transition(&self) -> &str {
        match self {
            Self::IllegalTransition { transition, .. }
            | Self::UndeclaredTarget { transition, .. }
            | Self::AlreadyFailed { transition }
            | Self::Aborted { transition, .. } => transition,
        }
    }
}

/// Count `error` as a failure when it moved the machine to failed, as a rejection otherwise
fn record(error: FsmError) -> FsmError {
    let transition = error.transition().to_string();
    if error.is_fatal() {
        FsmMetrics::record_failure(transition);
    } else {
        FsmMetrics::record_rejection(transition);
    }
    error
}

/// A state machine instance.
pub struct StateMachine<G: StateGraph> {
    name: String,
    state: Mutex<G::State>,
}

impl<G: StateGraph> StateMachine<G> {
    /// Create a machine in [`StateGraph::INITIAL`]; `name` labels log lines
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(G::INITIAL),
        }
    }

    fn lock(&self) -> MutexGuard<'_, G::State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> G::State {
        *self.lock()
    }

    /// Read the state under the transaction lock
    pub fn access<R>(&self, read: impl FnOnce(G::State) -> R) -> R {
        read(*self.lock())
    }

    /// Whether the machine has reached a terminal state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.access(G::is_terminal)
    }

    /// Run one transaction
    ///
    /// # Errors
    ///
    /// - [`FsmError::AlreadyFailed`]: the machine is failed; nothing ran.
    /// - [`FsmError::IllegalTransition`]: the transition cannot fire from the current state;
    ///   nothing ran and the state is unchanged.
    /// - [`FsmError::Aborted`]: the computation failed; the machine is now failed.
    /// - [`FsmError::UndeclaredTarget`]: the computed target is not declared; the machine is now
    ///   failed.
    pub fn execute<O, E, F>(&self, transition: G::Transition, computation: F) -> Result<O, FsmError>
    where
        E: fmt::Display,
        F: FnOnce(G::State) -> Result<StateAndOutput<G::State, O>, E>,
    {
        let mut state = self.lock();
        let from = *state;

        if from == G::FAILED {
            tracing::debug!(machine = %self.name, ?transition, "ignoring transition: already failed");
            return Err(FsmError::AlreadyFailed {
                transition: format!("{transition:?}"),
            });
        }

        if !G::permits(transition, from) {
            tracing::warn!(machine = %self.name, ?transition, state = ?from, "illegal transition");
            return Err(record(FsmError::IllegalTransition {
                transition: format!("{transition:?}"),
                state: format!("{from:?}"),
            }));
        }

        let StateAndOutput { state: to, output } = match computation(from) {
            Ok(next) => next,
            Err(error) => {
                *state = G::FAILED;
                tracing::error!(machine = %self.name, ?transition, state = ?from, %error, "transaction aborted");
                return Err(record(FsmError::Aborted {
                    transition: format!("{transition:?}"),
                    reason: error.to_string(),
                }));
            },
        };

        if !G::declares(transition, from, to) {
            *state = G::FAILED;
            tracing::error!(machine = %self.name, ?transition, from = ?from, to = ?to, "undeclared target");
            return Err(record(FsmError::UndeclaredTarget {
                transition: format!("{transition:?}"),
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            }));
        }

        *state = to;
        FsmMetrics::record_transition(format!("{transition:?}"));
        tracing::info!(machine = %self.name, ?transition, from = ?from, to = ?to, "state committed");
        Ok(output)
    }

    /// Fire `transition` to its single declared target, running `effect` inside the transaction
    ///
    /// # Errors
    ///
    /// As [`StateMachine::execute`]; a transition with several targets from the current state
    /// aborts the transaction.
    pub fn advance_with<O, E, F>(&self, transition: G::Transition, effect: F) -> Result<O, FsmError>
    where
        E: fmt::Display,
        F: FnOnce(G::State) -> Result<O, E>,
    {
        self.execute(transition, |from| match G::default_target(transition, from) {
            Some(to) => effect(from)
                .map(|output| StateAndOutput::new(to, output))
                .map_err(|error| error.to_string()),
            None => Err(AmbiguousTarget.to_string()),
        })
    }

    /// Fire `transition` to its single declared target, returning the new state
    ///
    /// # Errors
    ///
    /// As [`StateMachine::execute`].
    pub fn advance(&self, transition: G::Transition) -> Result<G::State, FsmError> {
        self.execute(transition, |from| {
            G::default_target(transition, from)
                .map(|to| StateAndOutput::new(to, to))
                .ok_or(AmbiguousTarget)
        })
    }
}

impl<G: StateGraph> fmt::Debug for StateMachine<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug)]
struct AmbiguousTarget;

impl fmt::Display for AmbiguousTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transition has no single declared target")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use proptest::prelude::*;
    use switchyard_core::lifecycle::{ComponentLifecycle, FsmState, FsmTransition};

    type Lifecycle = StateMachine<ComponentLifecycle>;

    const TRANSITIONS: [FsmTransition; 6] = [
        FsmTransition::CreateCompleted,
        FsmTransition::RegisterCompleted,
        FsmTransition::InitializeCompleted,
        FsmTransition::ExternalDestroy,
        FsmTransition::UnregisterCompleted,
        FsmTransition::InternalFailure,
    ];

    fn active() -> Lifecycle {
        let machine = Lifecycle::new("test");
        machine.advance(FsmTransition::CreateCompleted).unwrap();
        for _ in 0..3 {
            machine.advance(FsmTransition::RegisterCompleted).unwrap();
        }
        machine.advance(FsmTransition::InitializeCompleted).unwrap();
        machine
    }

    #[test]
    fn test_full_lifecycle_reaches_destroyed() {
        let machine = active();
        assert_eq!(machine.state(), FsmState::Active);

        machine.advance(FsmTransition::ExternalDestroy).unwrap();
        assert_eq!(machine.state(), FsmState::UnregisterPending3);
        machine.advance(FsmTransition::UnregisterCompleted).unwrap();
        machine.advance(FsmTransition::UnregisterCompleted).unwrap();
        assert_eq!(
            machine.advance(FsmTransition::UnregisterCompleted).unwrap(),
            FsmState::Destroyed
        );
    }

    #[test]
    fn test_illegal_transition_leaves_state_unchanged() {
        let machine = Lifecycle::new("test");
        let mut ran = false;
        let result = machine.execute(FsmTransition::InitializeCompleted, |_| {
            ran = true;
            Ok::<_, String>(StateAndOutput::state(FsmState::Active))
        });

        assert!(matches!(result, Err(FsmError::IllegalTransition { .. })));
        assert!(!ran);
        assert_eq!(machine.state(), FsmState::Created);
    }

    #[test]
    fn test_computation_error_fails_machine() {
        let machine = active();
        let result = machine.execute(FsmTransition::ExternalDestroy, |_| {
            Err::<StateAndOutput<FsmState, ()>, _>("proxy refused")
        });

        let error = result.unwrap_err();
        assert!(error.is_fatal());
        assert_eq!(error.transition(), "ExternalDestroy");
        assert_eq!(machine.state(), FsmState::Failed);
    }

    #[test]
    fn test_only_errors_that_fail_the_machine_are_fatal() {
        let fresh = Lifecycle::new("test");
        let illegal = fresh.advance(FsmTransition::InitializeCompleted).unwrap_err();
        assert!(!illegal.is_fatal());
        assert_eq!(fresh.state(), FsmState::Created);

        let undeclared = active()
            .execute(FsmTransition::ExternalDestroy, |_| {
                Ok::<_, String>(StateAndOutput::state(FsmState::Active))
            })
            .unwrap_err();
        assert!(undeclared.is_fatal());

        let failed = active();
        failed.advance(FsmTransition::InternalFailure).unwrap();
        let ignored = failed.advance(FsmTransition::ExternalDestroy).unwrap_err();
        assert!(!ignored.is_fatal());
        assert_eq!(ignored.transition(), "ExternalDestroy");
    }

    #[test]
    fn test_undeclared_target_fails_machine() {
        let machine = active();
        let result = machine.execute(FsmTransition::ExternalDestroy, |_| {
            Ok::<_, String>(StateAndOutput::state(FsmState::Destroyed))
        });

        assert!(matches!(result, Err(FsmError::UndeclaredTarget { .. })));
        assert_eq!(machine.state(), FsmState::Failed);
    }

    #[test]
    fn test_second_failure_is_a_noop() {
        let machine = active();
        machine.advance(FsmTransition::InternalFailure).unwrap();

        let mut ran = false;
        let result = machine.advance_with(FsmTransition::InternalFailure, |_| {
            ran = true;
            Ok::<_, String>(())
        });
        assert!(matches!(result, Err(FsmError::AlreadyFailed { .. })));
        assert!(!ran);
        assert_eq!(machine.state(), FsmState::Failed);
    }

    #[test]
    fn test_destroyed_rejects_everything_but_failure() {
        let machine = active();
        machine.advance(FsmTransition::ExternalDestroy).unwrap();
        for _ in 0..3 {
            machine.advance(FsmTransition::UnregisterCompleted).unwrap();
        }

        for transition in TRANSITIONS {
            if transition != FsmTransition::InternalFailure {
                assert!(machine.advance(transition).is_err());
                assert_eq!(machine.state(), FsmState::Destroyed);
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        let machine = active();
        assert!(!machine.is_terminal());
        machine.advance(FsmTransition::ExternalDestroy).unwrap();
        assert!(!machine.is_terminal());
        for _ in 0..3 {
            machine.advance(FsmTransition::UnregisterCompleted).unwrap();
        }
        assert!(machine.is_terminal());

        let failed = active();
        failed.advance(FsmTransition::InternalFailure).unwrap();
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_output_is_returned_after_commit() {
        let machine = active();
        let output = machine
            .advance_with(FsmTransition::ExternalDestroy, |from| {
                Ok::<_, String>(format!("left {from}"))
            })
            .unwrap();
        assert_eq!(output, "left Active");
        assert!(machine.access(|state| state == FsmState::UnregisterPending3));
    }

    proptest! {
        #[test]
        fn prop_only_declared_transitions_fire(sequence in prop::collection::vec(0usize..6, 0..40)) {
            let machine = Lifecycle::new("prop");
            for index in sequence {
                let transition = TRANSITIONS[index];
                let before = machine.state();
                match machine.advance(transition) {
                    Ok(after) => prop_assert!(ComponentLifecycle::declares(transition, before, after)),
                    Err(FsmError::AlreadyFailed { .. }) => prop_assert_eq!(before, FsmState::Failed),
                    Err(_) => prop_assert_eq!(machine.state(), before),
                }
            }
        }

        #[test]
        fn prop_failure_lands_in_failed(sequence in prop::collection::vec(0usize..5, 0..20)) {
            let machine = Lifecycle::new("prop");
            for index in sequence {
                let _ = machine.advance(TRANSITIONS[index]);
            }
            let _ = machine.advance(FsmTransition::InternalFailure);
            prop_assert_eq!(machine.state(), FsmState::Failed);
        }
    }
}
