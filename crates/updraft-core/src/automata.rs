//! Finite-state machine engine.
//!
//! Every long-lived loop in updraft (overlay binding, overlay listening,
//! the update lifecycle) is expressed as an explicit state machine so that
//! cancellation, backoff, and error budgets are data rather than
//! control-flow patterns.
//!
//! The engine is deliberately minimal: a transition table plus a
//! synchronized current state. [`Automata::event`] atomically reads the
//! current state and commits the transition; an undefined `(state, event)`
//! pair fails with [`UnmappedTransition`] and leaves the state unchanged.
//!
//! On-entry behavior belongs to the driver that owns the automata, not to
//! the engine. A driver dispatches on the destination state returned by
//! `event`, runs the entry action (which may be async and may do network
//! I/O), and feeds the action's resulting event back into `event` in a
//! loop. That keeps the single-writer discipline - one driver task per
//! automata - and no lock is ever held while an entry action runs.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Mutex;

use thiserror::Error;

/// A single edge of the transition table: raising `event` while in `src`
/// moves the machine to `dest`.
#[derive(Debug, Clone, Copy)]
pub struct Transition<S, E> {
    /// Source state.
    pub src: S,
    /// Triggering event.
    pub event: E,
    /// Destination state.
    pub dest: S,
}

/// Error returned when an event is raised from a state that has no
/// transition for it. The machine's state is unchanged.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("state {state} has no transition for event {event}")]
pub struct UnmappedTransition<S: Display + Debug, E: Display + Debug> {
    /// The state the machine was in when the event was raised.
    pub state: S,
    /// The event that had no mapping.
    pub event: E,
}

/// A synchronized transition-table state machine.
///
/// `S` and `E` are small copyable enums. The current state lives behind a
/// mutex; the lock is held only for the read-compare-write of a single
/// transition, never across entry actions.
pub struct Automata<S, E> {
    name: &'static str,
    current: Mutex<S>,
    transitions: HashMap<(S, E), S>,
}

impl<S, E> Automata<S, E>
where
    S: Copy + Eq + Hash + Display + Debug,
    E: Copy + Eq + Hash + Display + Debug,
{
    /// Builds an automata starting at `initial` with the given transition
    /// table. Later duplicates of the same `(src, event)` pair win.
    pub fn new(name: &'static str, initial: S, transitions: &[Transition<S, E>]) -> Self {
        let table = transitions
            .iter()
            .map(|t| ((t.src, t.event), t.dest))
            .collect();
        Self {
            name,
            current: Mutex::new(initial),
            transitions: table,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> S {
        *self.current.lock().expect("automata lock poisoned")
    }

    /// Returns true if the machine is currently in `state`.
    pub fn is(&self, state: S) -> bool {
        self.current() == state
    }

    /// Returns true if the machine is currently in any of `states`.
    pub fn is_any(&self, states: &[S]) -> bool {
        let current = self.current();
        states.iter().any(|s| *s == current)
    }

    /// Raises `event`, committing the mapped transition and returning the
    /// destination state.
    ///
    /// # Errors
    ///
    /// Returns [`UnmappedTransition`] when the current state has no
    /// transition for `event`; the state is left unchanged.
    pub fn event(&self, event: E) -> Result<S, UnmappedTransition<S, E>> {
        let mut current = self.current.lock().expect("automata lock poisoned");
        match self.transitions.get(&(*current, event)) {
            Some(dest) => {
                tracing::debug!(
                    automata = self.name,
                    %event,
                    from = %*current,
                    to = %dest,
                    "transition"
                );
                *current = *dest;
                Ok(*dest)
            },
            None => Err(UnmappedTransition {
                state: *current,
                event,
            }),
        }
    }
}

impl<S: Debug, E> Debug for Automata<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automata")
            .field("name", &self.name)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        Closed,
        Open,
        Draining,
    }

    impl Display for S {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum E {
        Open,
        Drain,
        Close,
    }

    impl Display for E {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn fixture() -> Automata<S, E> {
        Automata::new(
            "test",
            S::Closed,
            &[
                Transition { src: S::Closed, event: E::Open, dest: S::Open },
                Transition { src: S::Open, event: E::Drain, dest: S::Draining },
                Transition { src: S::Draining, event: E::Close, dest: S::Closed },
                Transition { src: S::Open, event: E::Close, dest: S::Closed },
            ],
        )
    }

    #[test]
    fn transitions_follow_the_table() {
        let fsm = fixture();
        assert_eq!(fsm.current(), S::Closed);
        assert_eq!(fsm.event(E::Open).unwrap(), S::Open);
        assert_eq!(fsm.event(E::Drain).unwrap(), S::Draining);
        assert_eq!(fsm.event(E::Close).unwrap(), S::Closed);
    }

    #[test]
    fn unmapped_event_leaves_state_unchanged() {
        let fsm = fixture();
        let err = fsm.event(E::Drain).unwrap_err();
        assert_eq!(err.state, S::Closed);
        assert_eq!(err.event, E::Drain);
        assert_eq!(fsm.current(), S::Closed);

        // Still usable after the failed event.
        assert_eq!(fsm.event(E::Open).unwrap(), S::Open);
    }

    #[test]
    fn every_defined_pair_resolves_deterministically() {
        // Replay the table from each source state and check the mapping is
        // stable across repeated runs.
        for _ in 0..3 {
            let fsm = fixture();
            assert_eq!(fsm.event(E::Open).unwrap(), S::Open);
            assert_eq!(fsm.event(E::Close).unwrap(), S::Closed);
        }
    }

    #[test]
    fn is_any_matches_current_state() {
        let fsm = fixture();
        assert!(fsm.is_any(&[S::Closed, S::Open]));
        assert!(!fsm.is_any(&[S::Draining]));
        fsm.event(E::Open).unwrap();
        assert!(fsm.is(S::Open));
    }
}
