//! Execution states and the arena that owns them

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::ir::{GotoFunction, SymbolId};
use crate::smt::Term;
use crate::symex::equation::EquationBuilder;
use crate::symex::store::Binding;

/// Index of a record in the [`StateArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub usize);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One call activation
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: SymbolId,
    pub pc: usize,
    pub activation: u32,
    /// Parameters, locals and the return slot
    pub locals: BTreeMap<SymbolId, Binding>,
    /// Caller variable receiving the return value
    pub ret_target: Option<SymbolId>,
    /// Suspended forks by the instruction index they resume at
    pub pending: BTreeMap<usize, Vec<StateId>>,
    /// Times each backward goto (by its index) has been taken
    pub loop_iterations: HashMap<usize, u32>,
}

impl Frame {
    pub fn new(function: &GotoFunction, activation: u32) -> Self {
        Self {
            function: function.name.clone(),
            pc: 0,
            activation,
            locals: BTreeMap::new(),
            ret_target: None,
            pending: BTreeMap::new(),
            loop_iterations: HashMap::new(),
        }
    }

    /// First resume point at or after `pc`
    pub fn next_pending(&self, pc: usize) -> Option<usize> {
        self.pending.range(pc..).next().map(|(&resume, _)| resume)
    }
}

/// Why a thread cannot make progress right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Lock(SymbolId),
    Join(usize),
}

/// One thread's symbolic execution cursor
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub tid: usize,
    pub frames: Vec<Frame>,
    /// Path condition under which this thread currently runs
    pub guard: Term,
    pub atomic_depth: u32,
    pub(crate) activations: HashMap<SymbolId, u32>,
    pub(crate) has_context_switch_occurred: bool,
    pub(crate) interleavings_blocked: bool,
    pub(crate) blocked: Option<BlockReason>,
    pub(crate) finished: bool,
    pub(crate) bound_reached: bool,
    /// Shared write waiting for its second phase (race flag already raised)
    pub(crate) race_phase: Option<usize>,
}

impl ExecutionState {
    pub fn new(tid: usize, guard: Term) -> Self {
        Self {
            tid,
            frames: Vec::new(),
            guard,
            atomic_depth: 0,
            activations: HashMap::new(),
            has_context_switch_occurred: false,
            interleavings_blocked: false,
            blocked: None,
            finished: false,
            bound_reached: false,
            race_phase: None,
        }
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    /// Function and instruction index the thread will execute next
    pub fn position(&self) -> Option<(&SymbolId, usize)> {
        self.frame().map(|f| (&f.function, f.pc))
    }

    pub(crate) fn next_activation(&mut self, function: &SymbolId) -> u32 {
        let n = self.activations.entry(function.clone()).or_insert(0);
        *n += 1;
        *n
    }

    /// Executed a synchronisation or shared-access point since the last
    /// context switch
    pub fn has_context_switch_occurred(&self) -> bool {
        self.has_context_switch_occurred
    }

    /// Context switching is currently disallowed (atomic section, a single
    /// live thread, or the context bound is used up)
    pub fn check_if_interleaves_blocked(&self) -> bool {
        self.interleavings_blocked
    }

    pub fn can_execution_continue(&self) -> bool {
        !self.finished && !self.bound_reached && self.blocked.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn blocked_on(&self) -> Option<&BlockReason> {
        self.blocked.as_ref()
    }

    /// Close this thread's contribution to the equation
    pub fn finish_formula(&mut self, equation: &mut EquationBuilder) {
        equation.close_contributor(self.tid);
        self.bound_reached |= !self.finished;
    }
}

/// Branch side waiting to be merged back into its thread
#[derive(Debug, Clone)]
pub struct ForkState {
    pub tid: usize,
    pub locals: BTreeMap<SymbolId, Binding>,
}

#[derive(Debug, Clone)]
pub enum StateKind {
    Thread(Box<ExecutionState>),
    Fork(ForkState),
    /// Thread temporarily taken out for stepping
    CheckedOut,
    Retired,
}

#[derive(Debug, Clone)]
pub struct StateNode {
    pub parent: Option<StateId>,
    /// Guard the record was created under
    pub guard: Term,
    pub kind: StateKind,
}

/// Index-addressed storage for thread cursors and suspended forks
#[derive(Debug, Clone, Default)]
pub struct StateArena {
    nodes: Vec<StateNode>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, parent: Option<StateId>, guard: Term, kind: StateKind) -> StateId {
        self.nodes.push(StateNode {
            parent,
            guard,
            kind,
        });
        StateId(self.nodes.len() - 1)
    }

    pub fn node(&self, id: StateId) -> Option<&StateNode> {
        self.nodes.get(id.0)
    }

    pub fn thread(&self, id: StateId) -> Option<&ExecutionState> {
        match self.nodes.get(id.0).map(|n| &n.kind) {
            Some(StateKind::Thread(state)) => Some(&**state),
            _ => None,
        }
    }

    pub fn thread_mut(&mut self, id: StateId) -> Option<&mut ExecutionState> {
        match self.nodes.get_mut(id.0).map(|n| &mut n.kind) {
            Some(StateKind::Thread(state)) => Some(&mut **state),
            _ => None,
        }
    }

    /// Take a thread out of the arena so it can be stepped alongside
    /// mutable access to the rest of the arena
    pub fn checkout(&mut self, id: StateId) -> Option<ExecutionState> {
        let node = self.nodes.get_mut(id.0)?;
        match std::mem::replace(&mut node.kind, StateKind::CheckedOut) {
            StateKind::Thread(state) => Some(*state),
            other => {
                node.kind = other;
                None
            }
        }
    }

    pub fn checkin(&mut self, id: StateId, state: ExecutionState) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.kind = StateKind::Thread(Box::new(state));
        }
    }

    /// Remove a fork for merging, retiring its slot
    pub fn take_fork(&mut self, id: StateId) -> Option<(Term, ForkState)> {
        let node = self.nodes.get_mut(id.0)?;
        match std::mem::replace(&mut node.kind, StateKind::Retired) {
            StateKind::Fork(fork) => Some((node.guard.clone(), fork)),
            other => {
                node.kind = other;
                None
            }
        }
    }

    pub fn live_forks(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, StateKind::Fork(_)))
            .count()
    }
}
