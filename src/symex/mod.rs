//! Reachability-tree symbolic execution
//!
//! A [`ReachabilityTree`] owns one execution state per program thread and
//! steps the current one instruction at a time. Every step appends guarded
//! effects to a shared [`EquationBuilder`]. At context-switch points the tree
//! commits to one thread ordering and records the alternatives, so that
//! [`ReachabilityTree::setup_next_formula`] can backtrack depth-first into
//! the next interleaving.
//!
//! Branches inside a thread do not create new threads of exploration: a
//! conditional goto suspends one side as a fork in the [`StateArena`] and the
//! fork is merged back when the running cursor reaches its resume point.

pub mod config;
pub mod equation;
pub mod policy;
pub mod reachability;
pub mod shared;
pub mod slice;
pub mod state;
pub mod step;
pub mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;

use crate::ir::{Location, ProgramError, SymbolId};

pub use config::ExploreConfig;
pub use equation::{Equation, EquationBuilder, ProtocolError, SsaStep, StepKind, StepSource};
pub use policy::InterleavingPolicy;
pub use reachability::{ExplorePhase, ExploreStatistics, ReachabilityTree, SwitchRecord, SymexResult};
pub use shared::SharedAccess;
pub use slice::slice;
pub use state::{ExecutionState, StateArena, StateId};
pub use step::StepOutcome;

/// Fatal exploration failures. Property violations are never errors; they
/// end up as claims in the equation.
#[derive(Debug, Error)]
pub enum SymexError {
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("exploration cancelled")]
    Cancelled,
    #[error("unsupported in `{function}` at {location}: {message}")]
    Unsupported {
        function: SymbolId,
        location: Location,
        message: String,
    },
}

/// Shared cancellation flag, optionally with a deadline. Checked by the
/// tree between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_deadline_in_the_past_cancels() {
        let past = Instant::now() - Duration::from_millis(1);
        assert!(CancellationToken::new().with_deadline(past).is_cancelled());
        let future = Instant::now() + Duration::from_secs(3600);
        assert!(!CancellationToken::new().with_deadline(future).is_cancelled());
    }
}
