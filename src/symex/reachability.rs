//! The reachability tree: interleaving exploration over thread states

use std::fmt;

use tracing::{debug, info, trace, warn};

use crate::ir::{GotoProgram, ProgramError};
use crate::smt::Term;
use crate::symex::config::ExploreConfig;
use crate::symex::equation::{Checkpoint, Equation, EquationBuilder, ProtocolError, StepKind, StepSource};
use crate::symex::shared::SharedAccess;
use crate::symex::state::{BlockReason, ExecutionState, StateArena, StateId, StateKind};
use crate::symex::step::{StepContext, StepOutcome};
use crate::symex::store::{Renaming, Store};
use crate::symex::{CancellationToken, SymexError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorePhase {
    /// Nothing set up yet
    Idle,
    Exploring,
    /// The current thread reached a switch point
    ContextSwitchPending,
    /// No thread can make further progress on this path
    Completed,
    /// The equation of this path has been frozen
    Finalized,
}

impl fmt::Display for ExplorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExplorePhase::Idle => "idle",
            ExplorePhase::Exploring => "exploring",
            ExplorePhase::ContextSwitchPending => "context switch pending",
            ExplorePhase::Completed => "completed",
            ExplorePhase::Finalized => "finalized",
        };
        write!(f, "{}", name)
    }
}

/// One context switch on the current path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchRecord {
    pub from: usize,
    pub to: usize,
    /// Number of steps executed before the switch
    pub step: usize,
    /// The thread switched away from had reached a switch point
    pub from_had_switch_point: bool,
}

impl fmt::Display for SwitchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{} -> t{} after step {}", self.from, self.to, self.step)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExploreStatistics {
    pub steps: usize,
    pub context_switches: usize,
    pub threads: usize,
    pub forks: usize,
    /// The path was cut by `max_steps`
    pub truncated: bool,
}

/// One explored interleaving, ready to be solved
#[derive(Debug, Clone)]
pub struct SymexResult {
    pub equation: Equation,
    pub total_claims: usize,
    pub remaining_claims: usize,
    pub schedule: Vec<SwitchRecord>,
    pub statistics: ExploreStatistics,
}

/// Everything that differs between interleavings
#[derive(Debug, Clone, Default)]
struct PathState {
    arena: StateArena,
    /// Arena record of each thread, by thread id
    threads: Vec<StateId>,
    current: usize,
    store: Store,
    names: Renaming,
    schedule: Vec<SwitchRecord>,
    stats: ExploreStatistics,
    decisions: u64,
}

/// Scheduling choice point with the alternatives not yet explored
#[derive(Debug)]
struct Decision {
    path: PathState,
    checkpoint: Checkpoint,
    remaining: Vec<usize>,
}

pub struct ReachabilityTree<'p> {
    program: &'p GotoProgram,
    config: ExploreConfig,
    shared: SharedAccess,
    equation: EquationBuilder,
    path: PathState,
    phase: ExplorePhase,
    decisions: Vec<Decision>,
    cancel: CancellationToken,
    formulas: usize,
}

impl<'p> ReachabilityTree<'p> {
    pub fn new(program: &'p GotoProgram, config: ExploreConfig) -> Self {
        let shared = if config.por {
            SharedAccess::analyze(program)
        } else {
            SharedAccess::everything(program)
        };
        Self {
            program,
            config,
            shared,
            equation: EquationBuilder::new(),
            path: PathState::default(),
            phase: ExplorePhase::Idle,
            decisions: Vec::new(),
            cancel: CancellationToken::new(),
            formulas: 0,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn program(&self) -> &'p GotoProgram {
        self.program
    }

    pub fn config(&self) -> &ExploreConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedAccess {
        &self.shared
    }

    pub fn phase(&self) -> ExplorePhase {
        self.phase
    }

    /// Switches taken on the current path
    pub fn schedule(&self) -> &[SwitchRecord] {
        &self.path.schedule
    }

    pub fn statistics(&self) -> &ExploreStatistics {
        &self.path.stats
    }

    /// Interleavings started since the last `setup_for_new_explore`
    pub fn formulas(&self) -> usize {
        self.formulas
    }

    pub fn current_tid(&self) -> usize {
        self.path.current
    }

    /// The thread the tree is currently stepping
    pub fn current_state(&self) -> Option<&ExecutionState> {
        self.state(self.path.current)
    }

    pub fn state(&self, tid: usize) -> Option<&ExecutionState> {
        let id = *self.path.threads.get(tid)?;
        self.path.arena.thread(id)
    }

    pub fn thread_count(&self) -> usize {
        self.path.threads.len()
    }

    /// Steps appended to the equation so far on this path
    pub fn equation(&self) -> &EquationBuilder {
        &self.equation
    }

    fn out_of_phase(&self, operation: &'static str) -> SymexError {
        SymexError::Protocol(ProtocolError::OutOfPhase {
            operation,
            phase: self.phase.to_string(),
        })
    }

    /// Start over with the main thread at the entry point and an empty
    /// equation
    pub fn setup_for_new_explore(&mut self) -> Result<(), SymexError> {
        self.equation.reset();
        self.decisions.clear();
        self.path = PathState::default();
        self.formulas = 1;

        let program = self.program;
        let entry = program
            .function(program.entry())
            .ok_or_else(|| ProgramError::MissingEntry(program.entry().clone()))?;
        let main = ExecutionState::new(0, Term::tt());
        let id = self
            .path
            .arena
            .insert(None, Term::tt(), StateKind::Thread(Box::new(main)));
        self.path.threads.push(id);
        self.equation.open_contributor(0)?;

        let mut state = self
            .path
            .arena
            .checkout(id)
            .ok_or(ProtocolError::RetiredState { thread: 0 })?;
        let mut cx = StepContext::new(
            program,
            &self.config,
            &self.shared,
            &mut self.path.arena,
            &mut self.path.store,
            &mut self.path.names,
            &mut self.equation,
            id,
            &self.path.threads,
        );
        let result = state.initialize(&mut cx, entry);
        self.path.arena.checkin(id, state);
        result?;

        self.path.stats.threads = 1;
        self.phase = ExplorePhase::Exploring;
        self.update_flags();
        info!(entry = %program.entry(), globals = program.globals().len(), "exploration set up");
        Ok(())
    }

    fn live_threads(&self) -> Vec<usize> {
        (0..self.path.threads.len())
            .filter(|&tid| self.state(tid).is_some_and(|s| !s.is_finished()))
            .collect()
    }

    fn context_bound_reached(&self) -> bool {
        self.config
            .context_bound
            .is_some_and(|b| self.path.stats.context_switches >= b)
    }

    fn update_flags(&mut self) {
        let live = self.live_threads().len();
        let bound = self.context_bound_reached();
        for &id in &self.path.threads {
            if let Some(state) = self.path.arena.thread_mut(id) {
                state.interleavings_blocked = state.atomic_depth > 0 || live < 2 || bound;
            }
        }
    }

    fn is_runnable(&self, tid: usize) -> bool {
        let Some(state) = self.state(tid) else {
            return false;
        };
        if state.is_finished() || state.bound_reached {
            return false;
        }
        match &state.blocked {
            None => true,
            Some(BlockReason::Lock(mutex)) => self
                .path
                .store
                .get(mutex)
                .and_then(|b| b.value.as_bool_const())
                != Some(true),
            Some(BlockReason::Join(target)) => self.state(*target).is_some_and(|t| t.is_finished()),
        }
    }

    /// Execute one instruction of the current thread
    pub fn step_current(&mut self) -> Result<StepOutcome, SymexError> {
        match self.phase {
            ExplorePhase::Exploring | ExplorePhase::ContextSwitchPending => {}
            _ => return Err(self.out_of_phase("step")),
        }
        if self.cancel.is_cancelled() {
            return Err(SymexError::Cancelled);
        }
        let tid = self.path.current;
        let id = *self
            .path
            .threads
            .get(tid)
            .ok_or(ProtocolError::UnknownContributor { thread: tid })?;
        let mut state = self
            .path
            .arena
            .checkout(id)
            .ok_or(ProtocolError::RetiredState { thread: tid })?;

        let mut cx = StepContext::new(
            self.program,
            &self.config,
            &self.shared,
            &mut self.path.arena,
            &mut self.path.store,
            &mut self.path.names,
            &mut self.equation,
            id,
            &self.path.threads,
        );
        let result = state.step(&mut cx);
        let spawned = cx.take_spawned();
        let forks = cx.forks;

        let outcome = match result {
            Ok(outcome) => {
                if outcome.is_switch_point() {
                    state.has_context_switch_occurred = true;
                }
                self.path.arena.checkin(id, state);
                outcome
            }
            Err(e) => {
                self.path.arena.checkin(id, state);
                return Err(e);
            }
        };
        for thread in spawned {
            let guard = thread.guard.clone();
            let sid = self
                .path
                .arena
                .insert(Some(id), guard, StateKind::Thread(Box::new(thread)));
            self.path.threads.push(sid);
        }
        self.path.stats.steps += 1;
        self.path.stats.forks += forks;
        self.path.stats.threads = self.path.threads.len();
        trace!(thread = tid, outcome = ?outcome, steps = self.path.stats.steps, "stepped");

        if self.config.max_steps.is_some_and(|max| self.path.stats.steps >= max) {
            self.truncate();
        } else if self.live_threads().is_empty() {
            self.phase = ExplorePhase::Completed;
        }
        self.update_flags();
        Ok(outcome)
    }

    fn truncate(&mut self) {
        warn!(steps = self.path.stats.steps, "step limit reached, path truncated");
        for &id in &self.path.threads {
            if let Some(state) = self.path.arena.thread_mut(id) {
                state.bound_reached |= !state.is_finished();
            }
        }
        self.path.stats.truncated = true;
        self.phase = ExplorePhase::Completed;
    }

    /// Drive the current path until its formula is complete
    pub fn get_next_formula(&mut self) -> Result<SymexResult, SymexError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SymexError::Cancelled);
            }
            match self.phase {
                ExplorePhase::Idle | ExplorePhase::Finalized => {
                    return Err(self.out_of_phase("get_next_formula"));
                }
                ExplorePhase::Completed => return self.finish_formula(),
                ExplorePhase::ContextSwitchPending => {
                    if !self.switch_to_next_execution_state()? {
                        self.phase = ExplorePhase::Completed;
                    }
                }
                ExplorePhase::Exploring => {
                    let continues = self
                        .current_state()
                        .is_some_and(|s| s.can_execution_continue());
                    if !continues {
                        self.phase = ExplorePhase::ContextSwitchPending;
                        continue;
                    }
                    let outcome = self.step_current()?;
                    if self.phase != ExplorePhase::Exploring {
                        continue;
                    }
                    let switch = match outcome {
                        StepOutcome::Blocked | StepOutcome::Finished => true,
                        StepOutcome::Executed { switch_point } => {
                            switch_point
                                && !self
                                    .current_state()
                                    .is_some_and(|s| s.check_if_interleaves_blocked())
                        }
                    };
                    if switch {
                        self.phase = ExplorePhase::ContextSwitchPending;
                    }
                }
            }
        }
    }

    /// Pick the thread to run next. Returns false when no thread can run,
    /// which completes the current path.
    pub fn switch_to_next_execution_state(&mut self) -> Result<bool, SymexError> {
        match self.phase {
            ExplorePhase::Completed | ExplorePhase::Finalized => return Ok(false),
            ExplorePhase::Idle => return Err(self.out_of_phase("switch_to_next_execution_state")),
            ExplorePhase::Exploring | ExplorePhase::ContextSwitchPending => {}
        }
        let current = self.path.current;
        let live = self.live_threads();
        if live.is_empty() {
            self.phase = ExplorePhase::Completed;
            return Ok(false);
        }
        let runnable: Vec<usize> = live.iter().copied().filter(|&t| self.is_runnable(t)).collect();
        if runnable.is_empty() {
            self.on_deadlock(&live)?;
            self.phase = ExplorePhase::Completed;
            return Ok(false);
        }

        let current_runnable = runnable.contains(&current);
        let atomic = self.current_state().is_some_and(|s| s.atomic_depth > 0);
        let candidates = if self.context_bound_reached() {
            if current_runnable { vec![current] } else { Vec::new() }
        } else if atomic && current_runnable {
            vec![current]
        } else {
            runnable
        };
        if candidates.is_empty() {
            debug!(thread = current, "context bound reached");
            self.phase = ExplorePhase::Completed;
            return Ok(false);
        }

        let order = self
            .config
            .policy
            .order(current, &candidates, self.path.decisions);
        if order.len() > 1 {
            self.decisions.push(Decision {
                path: self.path.clone(),
                checkpoint: self.equation.checkpoint(),
                remaining: order[1..].to_vec(),
            });
        }
        self.switch_to(order[0]);
        Ok(true)
    }

    fn switch_to(&mut self, next: usize) {
        let from = self.path.current;
        let had_switch_point = self
            .state(from)
            .is_some_and(|s| s.has_context_switch_occurred());
        if let Some(&id) = self.path.threads.get(from) {
            if let Some(state) = self.path.arena.thread_mut(id) {
                state.has_context_switch_occurred = false;
            }
        }
        if let Some(&id) = self.path.threads.get(next) {
            if let Some(state) = self.path.arena.thread_mut(id) {
                // runnable again; the blocking instruction is retried
                state.blocked = None;
            }
        }
        if next != from {
            self.path.stats.context_switches += 1;
            self.path.schedule.push(SwitchRecord {
                from,
                to: next,
                step: self.path.stats.steps,
                from_had_switch_point: had_switch_point,
            });
            debug!(from, to = next, step = self.path.stats.steps, "context switch");
        }
        self.path.current = next;
        self.path.decisions += 1;
        self.phase = ExplorePhase::Exploring;
        self.update_flags();
    }

    fn on_deadlock(&mut self, live: &[usize]) -> Result<(), SymexError> {
        info!(threads = ?live, "all live threads are blocked");
        if !self.config.deadlock_check {
            return Ok(());
        }
        let guard = Term::and(live.iter().filter_map(|&t| self.state(t)).map(|s| s.guard.clone()));
        let Some(state) = live
            .iter()
            .filter_map(|&t| self.state(t))
            .find(|s| self.equation.is_open(s.tid))
        else {
            return Ok(());
        };
        let source = match state.position() {
            Some((function, pc)) => StepSource {
                thread: state.tid,
                function: function.clone(),
                location: self
                    .program
                    .function(function)
                    .map(|f| f.location(pc))
                    .unwrap_or_default(),
            },
            None => StepSource {
                thread: state.tid,
                function: self.program.entry().clone(),
                location: Default::default(),
            },
        };
        let tid = state.tid;
        self.equation.append(
            tid,
            guard,
            StepKind::Assert {
                cond: Term::ff(),
                comment: "deadlock detected".to_string(),
            },
            source,
        )?;
        Ok(())
    }

    pub fn is_has_complete_formula(&self) -> bool {
        matches!(self.phase, ExplorePhase::Completed | ExplorePhase::Finalized)
    }

    /// Close every thread's contribution and freeze the equation
    pub fn finish_formula(&mut self) -> Result<SymexResult, SymexError> {
        if self.phase != ExplorePhase::Completed {
            return Err(self.out_of_phase("finish_formula"));
        }
        for &id in &self.path.threads {
            if let Some(state) = self.path.arena.thread_mut(id) {
                state.finish_formula(&mut self.equation);
            }
        }
        let equation = self.equation.freeze()?;
        self.phase = ExplorePhase::Finalized;
        let total_claims = equation.total_claims();
        let remaining_claims = equation.remaining_claims();
        info!(
            formula = self.formulas,
            steps = equation.len(),
            total_claims,
            remaining_claims,
            switches = self.path.stats.context_switches,
            "formula complete"
        );
        Ok(SymexResult {
            equation,
            total_claims,
            remaining_claims,
            schedule: self.path.schedule.clone(),
            statistics: self.path.stats.clone(),
        })
    }

    /// Backtrack to the latest decision with an untried choice. Returns
    /// false once every interleaving has been explored.
    pub fn setup_next_formula(&mut self) -> Result<bool, SymexError> {
        match self.phase {
            ExplorePhase::Completed | ExplorePhase::Finalized => {}
            _ => return Err(self.out_of_phase("setup_next_formula")),
        }
        while let Some(mut decision) = self.decisions.pop() {
            if decision.remaining.is_empty() {
                continue;
            }
            let next = decision.remaining.remove(0);
            self.equation.restore(&decision.checkpoint);
            self.path = if decision.remaining.is_empty() {
                decision.path
            } else {
                let path = decision.path.clone();
                self.decisions.push(decision);
                path
            };
            self.formulas += 1;
            info!(formula = self.formulas, from = self.path.current, to = next, "backtracking");
            self.switch_to(next);
            return Ok(true);
        }
        debug!(formulas = self.formulas, "interleavings exhausted");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::symex::InterleavingPolicy;

    const TWO_WRITERS: &str = "\
.global x i32
.function writer v:i32
    assign x v
.end
.function main
.local a thread
.local b thread
    create writer 1 -> a
    create writer 2 -> b
    join a
    join b
    assert (== x 2) \"second writer last\"
.end
";

    #[test]
    fn test_phase_protocol() {
        let program = parse_program(TWO_WRITERS).unwrap();
        let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
        assert_eq!(tree.phase(), ExplorePhase::Idle);
        assert!(tree.get_next_formula().is_err());
        assert!(tree.step_current().is_err());
        tree.setup_for_new_explore().unwrap();
        assert_eq!(tree.phase(), ExplorePhase::Exploring);
        assert!(tree.finish_formula().is_err());
        tree.get_next_formula().unwrap();
        assert_eq!(tree.phase(), ExplorePhase::Finalized);
        assert!(tree.is_has_complete_formula());
        assert!(matches!(
            tree.get_next_formula(),
            Err(SymexError::Protocol(ProtocolError::OutOfPhase { .. }))
        ));
    }

    #[test]
    fn test_all_interleavings_are_enumerated() {
        let program = parse_program(TWO_WRITERS).unwrap();
        let config = ExploreConfig::default().with_policy(InterleavingPolicy::Sequential);
        let mut tree = ReachabilityTree::new(&program, config);
        tree.setup_for_new_explore().unwrap();
        let mut count = 0;
        let mut failing = 0;
        loop {
            let result = tree.get_next_formula().unwrap();
            for switch in &result.schedule {
                assert!(switch.from_had_switch_point);
            }
            if result.remaining_claims > 0 {
                failing += 1;
            }
            count += 1;
            if !tree.setup_next_formula().unwrap() {
                break;
            }
        }
        assert!(count > 1);
        assert!(failing > 0 && failing < count);
        assert_eq!(tree.formulas(), count);
    }

    #[test]
    fn test_single_thread_needs_no_switch() {
        let program = parse_program(
            "\
.global g i32
.function main
.local x i32
    assign x 5
    assign g (+ x 1)
    assert (== g 6)
.end
",
        )
        .unwrap();
        let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
        tree.setup_for_new_explore().unwrap();
        while tree.current_state().is_some_and(|s| s.can_execution_continue()) {
            let outcome = tree.step_current().unwrap();
            assert!(tree.current_state().is_some_and(|s| s.check_if_interleaves_blocked()));
            if outcome == StepOutcome::Finished {
                break;
            }
        }
        assert!(tree.is_has_complete_formula());
        assert!(!tree.switch_to_next_execution_state().unwrap());
        let result = tree.finish_formula().unwrap();
        assert_eq!(result.total_claims, 0);
        assert!(result.schedule.is_empty());
    }

    #[test]
    fn test_max_steps_truncates() {
        let program = parse_program(
            "\
.function main
.local i i32
top:
    assign i (+ i 1)
    goto top
.end
",
        )
        .unwrap();
        let config = ExploreConfig::default().with_max_steps(Some(10));
        let mut tree = ReachabilityTree::new(&program, config);
        tree.setup_for_new_explore().unwrap();
        let result = tree.get_next_formula().unwrap();
        assert!(result.statistics.truncated);
        assert_eq!(result.statistics.steps, 10);
    }

    #[test]
    fn test_cancellation_stops_exploration() {
        let program = parse_program(TWO_WRITERS).unwrap();
        let token = CancellationToken::new();
        let mut tree = ReachabilityTree::new(&program, ExploreConfig::default()).with_cancellation(token.clone());
        tree.setup_for_new_explore().unwrap();
        token.cancel();
        assert!(matches!(tree.get_next_formula(), Err(SymexError::Cancelled)));
    }

    #[test]
    fn test_deadlock_claim() {
        let program = parse_program(
            "\
.global m mutex
.function main
    lock m
    lock m
.end
",
        )
        .unwrap();
        let config = ExploreConfig::default().with_deadlock_check(true);
        let mut tree = ReachabilityTree::new(&program, config);
        tree.setup_for_new_explore().unwrap();
        let result = tree.get_next_formula().unwrap();
        assert_eq!(result.total_claims, 1);
        assert_eq!(result.remaining_claims, 1);
        assert!(!tree.setup_next_formula().unwrap());
    }
}
