//! Symbolic execution of single instructions
//!
//! [`ExecutionState::step`] executes exactly one instruction of a thread.
//! Everything outside the thread itself (the shared store, the equation,
//! the arena holding suspended forks) is reached through a [`StepContext`]
//! that the reachability tree lends for the duration of the step.

use tracing::{debug, trace};

use crate::ir::types::THREAD_HANDLE_WIDTH;
use crate::ir::{
    BinaryOp, Endianness, Expr, GotoFunction, GotoProgram, Instruction, ProgramError, SymbolId,
    Type, UnaryOp,
};
use crate::smt::{BvBinaryOp, BvCompareOp, BvUnaryOp, Term, Value};
use crate::symex::SymexError;
use crate::symex::config::ExploreConfig;
use crate::symex::equation::{EquationBuilder, ProtocolError, StepKind, StepSource};
use crate::symex::shared::SharedAccess;
use crate::symex::state::{BlockReason, ExecutionState, ForkState, Frame, StateArena, StateId, StateKind};
use crate::symex::store::{Binding, Renaming, Store, local_l1, race_flag_l1};

/// Name of the per-frame slot holding the return value
const RETURN_SLOT: &str = "$return";

/// What a step did, as far as scheduling is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed { switch_point: bool },
    /// The instruction cannot execute yet (lock held, join target running)
    Blocked,
    /// The thread returned from its start function
    Finished,
}

impl StepOutcome {
    pub fn is_switch_point(&self) -> bool {
        match self {
            StepOutcome::Executed { switch_point } => *switch_point,
            StepOutcome::Blocked | StepOutcome::Finished => true,
        }
    }
}

/// Path-wide resources a step may touch
pub struct StepContext<'a> {
    pub program: &'a GotoProgram,
    pub config: &'a ExploreConfig,
    pub shared: &'a SharedAccess,
    pub arena: &'a mut StateArena,
    pub store: &'a mut Store,
    pub names: &'a mut Renaming,
    pub equation: &'a mut EquationBuilder,
    /// Arena record of the stepping thread
    pub self_id: StateId,
    /// Arena records of all threads, by thread id
    pub threads: &'a [StateId],
    pub(crate) next_tid: usize,
    pub(crate) spawned: Vec<ExecutionState>,
    pub(crate) forks: usize,
    touched_shared: bool,
    check_races: bool,
}

impl<'a> StepContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'a GotoProgram,
        config: &'a ExploreConfig,
        shared: &'a SharedAccess,
        arena: &'a mut StateArena,
        store: &'a mut Store,
        names: &'a mut Renaming,
        equation: &'a mut EquationBuilder,
        self_id: StateId,
        threads: &'a [StateId],
    ) -> Self {
        Self {
            program,
            config,
            shared,
            arena,
            store,
            names,
            equation,
            self_id,
            threads,
            next_tid: threads.len(),
            spawned: Vec::new(),
            forks: 0,
            touched_shared: false,
            check_races: config.data_races_check,
        }
    }

    /// Threads created during the step, in thread-id order
    pub fn take_spawned(&mut self) -> Vec<ExecutionState> {
        std::mem::take(&mut self.spawned)
    }

    fn function(&self, name: &SymbolId) -> Result<&'a GotoFunction, SymexError> {
        let program = self.program;
        program
            .function(name)
            .ok_or_else(|| SymexError::Program(ProgramError::MissingEntry(name.clone())))
    }

    fn append(&mut self, src: &StepSource, guard: &Term, kind: StepKind) -> Result<usize, SymexError> {
        Ok(self
            .equation
            .append(src.thread, guard.clone(), kind, src.clone())?)
    }
}

fn literal(value: i128, ty: Type) -> Term {
    match ty.width() {
        Some(w) => Term::bv(value as u64, w),
        None => Term::bool(value != 0),
    }
}

/// Convert between types the way an implicit C conversion would
pub fn coerce(term: Term, from: Type, to: Type) -> Term {
    match (from.width(), to.width()) {
        (None, None) => term,
        (Some(w), None) => Term::not(Term::eq(term, Term::bv(0, w))),
        (None, Some(w)) => Term::ite(term, Term::bv(1, w), Term::bv(0, w)),
        (Some(a), Some(b)) if a == b => term,
        (Some(a), Some(b)) if b > a => {
            if from.is_signed() {
                Term::sign_ext(b - a, term)
            } else {
                Term::zero_ext(b - a, term)
            }
        }
        (Some(_), Some(b)) => Term::extract(b - 1, 0, term),
    }
}

/// Condition under which signed `a op b` does not overflow. Stays at
/// `width` bits so the folder and the evaluator never see wider vectors.
fn no_overflow(op: BvBinaryOp, a: &Term, b: &Term, width: u32) -> Option<Term> {
    let negative = |t: Term| Term::bv_compare(BvCompareOp::Slt, t, Term::bv(0, width));
    let min = Term::bv(1u64 << (width - 1), width);
    let minus_one = Term::bv(u64::MAX, width);
    match op {
        BvBinaryOp::Add | BvBinaryOp::Sub => {
            let result = negative(Term::bv_binary(op, a.clone(), b.clone()));
            let sa = negative(a.clone());
            let sb = negative(b.clone());
            // add overflows when both signs agree and the result flips;
            // sub when the signs differ and the result leaves a's sign
            let operands = if op == BvBinaryOp::Add {
                Term::eq(sa.clone(), sb)
            } else {
                Term::not(Term::eq(sa.clone(), sb))
            };
            Some(Term::not(Term::and([operands, Term::not(Term::eq(result, sa))])))
        }
        BvBinaryOp::Mul => {
            let product = Term::bv_binary(op, a.clone(), b.clone());
            let back = Term::bv_binary(BvBinaryOp::Sdiv, product, b.clone());
            Some(Term::or([
                Term::eq(b.clone(), Term::bv(0, width)),
                Term::and([
                    Term::eq(back, a.clone()),
                    Term::not(Term::and([
                        Term::eq(a.clone(), min),
                        Term::eq(b.clone(), minus_one),
                    ])),
                ]),
            ]))
        }
        BvBinaryOp::Sdiv => Some(Term::not(Term::and([
            Term::eq(a.clone(), min),
            Term::eq(b.clone(), minus_one),
        ]))),
        _ => None,
    }
}

impl ExecutionState {
    fn top(&self) -> Result<&Frame, SymexError> {
        self.frames
            .last()
            .ok_or(SymexError::Protocol(ProtocolError::RetiredState { thread: self.tid }))
    }

    fn top_mut(&mut self) -> Result<&mut Frame, SymexError> {
        let tid = self.tid;
        self.frames
            .last_mut()
            .ok_or(SymexError::Protocol(ProtocolError::RetiredState { thread: tid }))
    }

    fn source(&self, cx: &StepContext<'_>) -> Result<StepSource, SymexError> {
        let frame = self.top()?;
        let func = cx.function(&frame.function)?;
        Ok(StepSource {
            thread: self.tid,
            function: frame.function.clone(),
            location: func.location(frame.pc),
        })
    }

    fn unsupported(&self, src: &StepSource, message: impl Into<String>) -> SymexError {
        SymexError::Unsupported {
            function: src.function.clone(),
            location: src.location,
            message: message.into(),
        }
    }

    fn type_error(&self, src: &StepSource, message: impl Into<String>) -> SymexError {
        SymexError::Program(ProgramError::TypeMismatch {
            function: src.function.clone(),
            location: src.location,
            message: message.into(),
        })
    }

    fn advance(&mut self) -> Result<(), SymexError> {
        self.top_mut()?.pc += 1;
        Ok(())
    }

    /// Fresh bindings for a new activation of `function`
    fn new_frame(
        &mut self,
        cx: &mut StepContext<'_>,
        function: &GotoFunction,
    ) -> Frame {
        let activation = self.next_activation(&function.name);
        let mut frame = Frame::new(function, activation);
        let slot = SymbolId::new(RETURN_SLOT);
        let vars = function
            .params
            .iter()
            .chain(&function.locals)
            .map(|v| (&v.name, v.ty))
            .chain(function.return_type.map(|ty| (&slot, ty)));
        for (name, ty) in vars {
            let l1 = local_l1(&function.name, name, self.tid, activation);
            frame
                .locals
                .insert(name.clone(), cx.names.free(name, &l1, ty));
        }
        frame
    }

    /// Assign `value` to a variable of `frame`, appending on behalf of
    /// `src.thread`
    fn bind_local(
        cx: &mut StepContext<'_>,
        src: &StepSource,
        guard: &Term,
        frame: &mut Frame,
        name: &SymbolId,
        value: Term,
        hidden: bool,
    ) -> Result<(), SymexError> {
        let Some(prev) = frame.locals.get(name) else {
            return Err(SymexError::Program(ProgramError::UnresolvedSymbol {
                symbol: name.clone(),
                function: frame.function.clone(),
                location: src.location,
            }));
        };
        let ty = prev.ty;
        let lhs = cx.names.next(name, &prev.name.l1);
        let binding = Binding {
            value: if value.is_const() {
                value.clone()
            } else {
                lhs.symbol(ty)
            },
            name: lhs.clone(),
            ty,
        };
        cx.append(
            src,
            guard,
            StepKind::Assignment {
                lhs,
                ty,
                rhs: value,
                hidden,
            },
        )?;
        frame.locals.insert(name.clone(), binding);
        Ok(())
    }

    /// Push the start frame and initialise the globals. Only for the main
    /// thread, before its first step.
    pub(crate) fn initialize(
        &mut self,
        cx: &mut StepContext<'_>,
        entry: &GotoFunction,
    ) -> Result<(), SymexError> {
        let frame = self.new_frame(cx, entry);
        self.frames.push(frame);
        let src = StepSource {
            thread: self.tid,
            function: entry.name.clone(),
            location: Default::default(),
        };
        let program = cx.program;
        for g in program.globals() {
            let value = match &g.init {
                Some(init) => self.eval(cx, &src, init, Some(g.ty))?.0,
                None => Term::from_value(Value::zero(g.ty.sort())),
            };
            let lhs = cx.names.next(&g.name, g.name.as_str());
            let binding = Binding {
                value: if value.is_const() {
                    value.clone()
                } else {
                    lhs.symbol(g.ty)
                },
                name: lhs.clone(),
                ty: g.ty,
            };
            cx.append(
                &src,
                &Term::tt(),
                StepKind::Assignment {
                    lhs,
                    ty: g.ty,
                    rhs: value,
                    hidden: true,
                },
            )?;
            cx.store.set(g.name.clone(), binding);
        }
        Ok(())
    }

    /// Execute exactly one instruction
    pub fn step(&mut self, cx: &mut StepContext<'_>) -> Result<StepOutcome, SymexError> {
        if self.finished {
            return Err(ProtocolError::RetiredState { thread: self.tid }.into());
        }
        cx.touched_shared = false;
        cx.check_races = cx.config.data_races_check;
        self.blocked = None;
        self.settle(cx)?;

        let src = self.source(cx)?;
        let frame = self.top()?;
        let pc = frame.pc;
        let func = cx.function(&frame.function)?;
        if pc >= func.end_index() {
            return self.exit_function(cx);
        }
        let instruction = &func.body[pc].instruction;
        trace!(thread = self.tid, function = %func.name, pc, instruction = %instruction, "step");

        let sync = match instruction {
            Instruction::Assign { lhs, rhs } => return self.step_assign(cx, &src, pc, lhs, rhs),
            Instruction::Assume(cond) => {
                let (c, _) = self.eval(cx, &src, cond, Some(Type::Bool))?;
                if !Term::implies(self.guard.clone(), c.clone()).is_true() {
                    cx.append(&src, &self.guard, StepKind::Assume { cond: c.clone() })?;
                }
                if c.is_false() {
                    self.guard = Term::ff();
                }
                self.advance()?;
                false
            }
            Instruction::Assert { cond, comment } => {
                let (c, _) = self.eval(cx, &src, cond, Some(Type::Bool))?;
                let comment = if comment.is_empty() { "assertion" } else { comment.as_str() };
                self.claim(cx, &src, c, comment)?;
                self.advance()?;
                false
            }
            Instruction::Goto { guard, target } => {
                self.step_goto(cx, &src, pc, guard.as_ref(), *target)?;
                false
            }
            Instruction::Call {
                function,
                args,
                ret,
            } => {
                self.step_call(cx, &src, function, args, ret.as_ref())?;
                false
            }
            Instruction::Return(value) => {
                self.step_return(cx, &src, func, pc, value.as_ref())?;
                false
            }
            Instruction::ThreadCreate {
                function,
                args,
                handle,
            } => {
                self.step_create(cx, &src, function, args, handle.as_ref())?;
                true
            }
            Instruction::ThreadJoin(handle) => {
                let (h, _) = self.read(cx, &src, handle)?;
                let Some((target, _)) = h.as_bv_const() else {
                    return Err(self.unsupported(
                        &src,
                        format!("join on `{}`, whose thread is not known at this point", handle),
                    ));
                };
                let target = target as usize;
                if target >= cx.threads.len() && target != self.tid {
                    return Err(self.unsupported(&src, format!("join on unknown thread {}", target)));
                }
                let done = cx
                    .threads
                    .get(target)
                    .and_then(|id| cx.arena.thread(*id))
                    .is_some_and(|t| t.is_finished());
                if !done {
                    debug!(thread = self.tid, target, "join blocks");
                    self.blocked = Some(BlockReason::Join(target));
                    return Ok(StepOutcome::Blocked);
                }
                self.advance()?;
                true
            }
            Instruction::Lock(mutex) => {
                let (held, _) = self.read(cx, &src, mutex)?;
                match held.as_bool_const() {
                    Some(true) => {
                        debug!(thread = self.tid, mutex = %mutex, "lock blocks");
                        self.blocked = Some(BlockReason::Lock(mutex.clone()));
                        return Ok(StepOutcome::Blocked);
                    }
                    Some(false) => {}
                    None => {
                        cx.append(&src, &self.guard, StepKind::Assume { cond: Term::not(held) })?;
                    }
                }
                self.write(cx, &src, mutex, Term::tt(), false)?;
                self.advance()?;
                true
            }
            Instruction::Unlock(mutex) => {
                self.write(cx, &src, mutex, Term::ff(), false)?;
                self.advance()?;
                true
            }
            Instruction::AtomicBegin => {
                self.atomic_depth += 1;
                self.advance()?;
                false
            }
            Instruction::AtomicEnd => {
                self.atomic_depth = self.atomic_depth.saturating_sub(1);
                self.advance()?;
                true
            }
            Instruction::Skip => {
                self.advance()?;
                false
            }
        };
        Ok(StepOutcome::Executed {
            switch_point: sync || cx.touched_shared,
        })
    }

    /// Merge forks waiting at the current instruction and skip code that is
    /// unreachable under a false guard
    fn settle(&mut self, cx: &mut StepContext<'_>) -> Result<(), SymexError> {
        loop {
            let frame = self.top_mut()?;
            let pc = frame.pc;
            if let Some(forks) = frame.pending.remove(&pc) {
                for id in forks {
                    self.merge_fork(cx, id)?;
                }
            }
            if !self.guard.is_false() {
                return Ok(());
            }
            let frame = self.top()?;
            let end = cx.function(&frame.function)?.end_index();
            if frame.pc >= end {
                return Ok(());
            }
            let next = frame.next_pending(frame.pc + 1).unwrap_or(end);
            trace!(thread = self.tid, from = frame.pc, to = next, "skipping dead code");
            self.top_mut()?.pc = next;
        }
    }

    fn merge_fork(&mut self, cx: &mut StepContext<'_>, id: StateId) -> Result<(), SymexError> {
        let Some((fork_guard, fork)) = cx.arena.take_fork(id) else {
            return Ok(());
        };
        if fork_guard.is_false() {
            return Ok(());
        }
        if self.guard.is_false() {
            self.top_mut()?.locals = fork.locals;
            self.guard = fork_guard;
            return Ok(());
        }
        let src = self.source(cx)?;
        let frame = self.top()?;
        let mut phis = Vec::new();
        for (name, theirs) in &fork.locals {
            if let Some(ours) = frame.locals.get(name) {
                if ours.value != theirs.value {
                    let rhs = Term::ite(fork_guard.clone(), theirs.value.clone(), ours.value.clone());
                    phis.push((name.clone(), rhs));
                }
            }
        }
        debug!(thread = self.tid, fork = %id, phis = phis.len(), "merging fork");
        let tid = self.tid;
        let frame = self
            .frames
            .last_mut()
            .ok_or(SymexError::Protocol(ProtocolError::RetiredState { thread: tid }))?;
        for (name, rhs) in phis {
            Self::bind_local(cx, &src, &Term::tt(), frame, &name, rhs, true)?;
        }
        self.guard = Term::or([self.guard.clone(), fork_guard]);
        Ok(())
    }

    /// Suspend a copy of the current frame's locals, to be merged back at
    /// `resume`
    fn suspend(&mut self, cx: &mut StepContext<'_>, resume: usize, guard: Term) -> Result<(), SymexError> {
        let tid = self.tid;
        let frame = self.top_mut()?;
        let fork = ForkState {
            tid,
            locals: frame.locals.clone(),
        };
        let id = cx.arena.insert(Some(cx.self_id), guard, StateKind::Fork(fork));
        frame.pending.entry(resume).or_default().push(id);
        cx.forks += 1;
        debug!(thread = tid, fork = %id, resume, "fork suspended");
        Ok(())
    }

    fn step_goto(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        pc: usize,
        guard: Option<&Expr>,
        target: usize,
    ) -> Result<(), SymexError> {
        let cond = match guard {
            Some(e) => self.eval(cx, src, e, Some(Type::Bool))?.0,
            None => Term::tt(),
        };
        let taken = Term::and([self.guard.clone(), cond.clone()]);
        let not_taken = Term::and([self.guard.clone(), Term::not(cond.clone())]);

        if target > pc {
            if !taken.is_false() {
                self.suspend(cx, target, taken)?;
            }
            self.guard = not_taken;
            return self.advance();
        }

        let count = self.top()?.loop_iterations.get(&pc).copied().unwrap_or(0) + 1;
        let within_bound = cx.config.unwind.map_or(true, |k| count < k);
        if within_bound && !taken.is_false() {
            if !not_taken.is_false() {
                self.suspend(cx, pc + 1, not_taken)?;
            }
            let frame = self.top_mut()?;
            // inner loops start counting afresh on every outer iteration
            frame.loop_iterations.retain(|&at, _| at < target || at >= pc);
            frame.loop_iterations.insert(pc, count);
            frame.pc = target;
            self.guard = taken;
            return Ok(());
        }
        if !taken.is_false() {
            debug!(thread = self.tid, pc, iterations = count, "unwind bound reached");
            if cx.config.unwinding_assertions {
                self.claim(cx, src, Term::not(cond), "unwinding assertion")?;
            } else {
                cx.append(src, &self.guard, StepKind::Assume { cond: Term::not(cond) })?;
            }
        }
        self.guard = not_taken;
        self.advance()
    }

    fn step_call(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        function: &SymbolId,
        args: &[Expr],
        ret: Option<&SymbolId>,
    ) -> Result<(), SymexError> {
        let callee = cx.function(function)?;
        let depth = self.frames.iter().filter(|f| &f.function == function).count() as u32;
        if cx.config.unwind.is_some_and(|k| depth >= k) {
            debug!(thread = self.tid, function = %function, depth, "recursion bound reached");
            if cx.config.unwinding_assertions {
                self.claim(cx, src, Term::ff(), "recursion unwinding assertion")?;
            } else {
                cx.append(src, &self.guard, StepKind::Assume { cond: Term::ff() })?;
            }
            self.guard = Term::ff();
            return self.advance();
        }
        let values = self.eval_args(cx, src, callee, args)?;
        let mut frame = self.new_frame(cx, callee);
        frame.ret_target = ret.cloned();
        let guard = self.guard.clone();
        for (param, value) in callee.params.iter().zip(values) {
            Self::bind_local(cx, src, &guard, &mut frame, &param.name, value, true)?;
        }
        trace!(thread = self.tid, function = %function, activation = frame.activation, "call");
        self.frames.push(frame);
        Ok(())
    }

    fn eval_args(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        callee: &GotoFunction,
        args: &[Expr],
    ) -> Result<Vec<Term>, SymexError> {
        let mut values = Vec::with_capacity(args.len());
        for (param, arg) in callee.params.iter().zip(args) {
            values.push(self.eval(cx, src, arg, Some(param.ty))?.0);
        }
        Ok(values)
    }

    fn step_return(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        func: &GotoFunction,
        pc: usize,
        value: Option<&Expr>,
    ) -> Result<(), SymexError> {
        if let Some(e) = value {
            match func.return_type {
                Some(ty) => {
                    let (v, _) = self.eval(cx, src, e, Some(ty))?;
                    let guard = self.guard.clone();
                    let frame = self.top_mut()?;
                    Self::bind_local(cx, src, &guard, frame, &SymbolId::new(RETURN_SLOT), v, true)?;
                }
                None => {
                    self.eval(cx, src, e, None)?;
                }
            }
        }
        let end = func.end_index();
        let frame = self.top()?;
        if frame.next_pending(pc + 1).is_some_and(|r| r < end) {
            // forks still wait in between; park this path at the end
            let guard = self.guard.clone();
            self.suspend(cx, end, guard)?;
            self.guard = Term::ff();
            self.advance()
        } else {
            self.top_mut()?.pc = end;
            Ok(())
        }
    }

    fn exit_function(&mut self, cx: &mut StepContext<'_>) -> Result<StepOutcome, SymexError> {
        let frame = self.frames.pop().ok_or(SymexError::Protocol(ProtocolError::RetiredState {
            thread: self.tid,
        }))?;
        if self.frames.is_empty() {
            self.finished = true;
            self.atomic_depth = 0;
            cx.equation.close_contributor(self.tid);
            debug!(thread = self.tid, function = %frame.function, "thread finished");
            return Ok(StepOutcome::Finished);
        }
        trace!(thread = self.tid, function = %frame.function, "return");
        let src = self.source(cx)?;
        if let Some(target) = &frame.ret_target {
            if let Some(slot) = frame.locals.get(RETURN_SLOT) {
                let target_ty = self.type_of(cx, target, &src)?;
                let value = coerce(slot.value.clone(), slot.ty, target_ty);
                self.write(cx, &src, target, value, false)?;
            }
        }
        self.advance()?;
        Ok(StepOutcome::Executed {
            switch_point: cx.touched_shared,
        })
    }

    fn step_create(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        function: &SymbolId,
        args: &[Expr],
        handle: Option<&SymbolId>,
    ) -> Result<(), SymexError> {
        let callee = cx.function(function)?;
        let values = self.eval_args(cx, src, callee, args)?;
        let tid = cx.next_tid;
        cx.next_tid += 1;
        let mut thread = ExecutionState::new(tid, self.guard.clone());
        let mut frame = thread.new_frame(cx, callee);
        cx.equation.open_contributor(tid)?;
        let guard = self.guard.clone();
        for (param, value) in callee.params.iter().zip(values) {
            Self::bind_local(cx, src, &guard, &mut frame, &param.name, value, true)?;
        }
        thread.frames.push(frame);
        cx.spawned.push(thread);
        debug!(creator = self.tid, thread = tid, function = %function, "thread created");
        if let Some(h) = handle {
            self.write(cx, src, h, Term::bv(tid as u64, THREAD_HANDLE_WIDTH), false)?;
        }
        self.advance()
    }

    fn step_assign(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        pc: usize,
        lhs: &SymbolId,
        rhs: &Expr,
    ) -> Result<StepOutcome, SymexError> {
        let ty = self.type_of(cx, lhs, src)?;
        let racy = cx.config.data_races_check
            && self.is_global(cx, lhs)
            && cx.shared.is_shared(lhs)
            && ty != Type::Mutex;

        if racy && self.race_phase != Some(pc) {
            // first phase: check the accessed variables, then raise our flag
            let mut accessed = rhs.symbols();
            accessed.push(lhs.clone());
            for sym in &accessed {
                if self.is_global(cx, sym) && cx.shared.is_shared(sym) {
                    self.race_claim(cx, src, sym)?;
                }
            }
            self.write_race_flag(cx, src, lhs, true)?;
            self.race_phase = Some(pc);
            return Ok(StepOutcome::Executed { switch_point: true });
        }

        if racy {
            cx.check_races = false;
        }
        let (value, _) = self.eval(cx, src, rhs, Some(ty))?;
        self.write(cx, src, lhs, value, false)?;
        if racy {
            self.write_race_flag(cx, src, lhs, false)?;
            self.race_phase = None;
        }
        self.advance()?;
        Ok(StepOutcome::Executed {
            switch_point: cx.touched_shared,
        })
    }

    fn race_claim(&mut self, cx: &mut StepContext<'_>, src: &StepSource, name: &SymbolId) -> Result<(), SymexError> {
        let Some(flag) = cx.store.race_flag(name) else {
            return Ok(());
        };
        let clear = Term::not(flag.value.clone());
        self.claim(cx, src, clear, &format!("data race on {}", name))
    }

    fn write_race_flag(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        name: &SymbolId,
        raised: bool,
    ) -> Result<(), SymexError> {
        let l1 = race_flag_l1(name);
        let prev = cx
            .store
            .race_flag(name)
            .map(|b| b.value.clone())
            .unwrap_or_else(Term::ff);
        let rhs = Term::ite(self.guard.clone(), Term::bool(raised), prev);
        let lhs = cx.names.next(&SymbolId::new(&l1), &l1);
        let binding = Binding {
            value: if rhs.is_const() {
                rhs.clone()
            } else {
                lhs.symbol(Type::Bool)
            },
            name: lhs.clone(),
            ty: Type::Bool,
        };
        cx.append(
            src,
            &self.guard,
            StepKind::Assignment {
                lhs,
                ty: Type::Bool,
                rhs,
                hidden: true,
            },
        )?;
        cx.store.set_race_flag(name.clone(), binding);
        Ok(())
    }

    /// Record a property that must hold under the current guard
    fn claim(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        cond: Term,
        comment: &str,
    ) -> Result<(), SymexError> {
        if Term::implies(self.guard.clone(), cond.clone()).is_true() {
            return Ok(());
        }
        cx.append(
            src,
            &self.guard,
            StepKind::Assert {
                cond,
                comment: comment.to_string(),
            },
        )?;
        Ok(())
    }

    fn is_global(&self, cx: &StepContext<'_>, name: &SymbolId) -> bool {
        let local = self.frames.last().is_some_and(|f| f.locals.contains_key(name));
        !local && cx.program.global(name).is_some()
    }

    fn type_of(&self, cx: &StepContext<'_>, name: &SymbolId, src: &StepSource) -> Result<Type, SymexError> {
        if let Some(b) = self.frames.last().and_then(|f| f.locals.get(name)) {
            return Ok(b.ty);
        }
        cx.program
            .global(name)
            .map(|g| g.ty)
            .ok_or_else(|| {
                SymexError::Program(ProgramError::UnresolvedSymbol {
                    symbol: name.clone(),
                    function: src.function.clone(),
                    location: src.location,
                })
            })
    }

    fn read(&mut self, cx: &mut StepContext<'_>, src: &StepSource, name: &SymbolId) -> Result<(Term, Type), SymexError> {
        if let Some(b) = self.frames.last().and_then(|f| f.locals.get(name)) {
            return Ok((b.value.clone(), b.ty));
        }
        let Some(binding) = cx.store.get(name) else {
            return Err(SymexError::Program(ProgramError::UnresolvedSymbol {
                symbol: name.clone(),
                function: src.function.clone(),
                location: src.location,
            }));
        };
        let (value, ty) = (binding.value.clone(), binding.ty);
        if cx.shared.is_shared(name) {
            cx.touched_shared = true;
            if cx.check_races && ty != Type::Mutex {
                self.race_claim(cx, src, name)?;
            }
        }
        Ok((value, ty))
    }

    fn write(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        name: &SymbolId,
        value: Term,
        hidden: bool,
    ) -> Result<(), SymexError> {
        let guard = self.guard.clone();
        if let Some(frame) = self.frames.last_mut() {
            if frame.locals.contains_key(name) {
                return Self::bind_local(cx, src, &guard, frame, name, value, hidden);
            }
        }
        let Some(prev) = cx.store.get(name).cloned() else {
            return Err(SymexError::Program(ProgramError::UnresolvedSymbol {
                symbol: name.clone(),
                function: src.function.clone(),
                location: src.location,
            }));
        };
        if cx.shared.is_shared(name) {
            cx.touched_shared = true;
        }
        // other threads read the store directly, so the guard goes into the value
        let rhs = Term::ite(guard.clone(), value, prev.value.clone());
        let lhs = cx.names.next(name, &prev.name.l1);
        let binding = Binding {
            value: if rhs.is_const() {
                rhs.clone()
            } else {
                lhs.symbol(prev.ty)
            },
            name: lhs.clone(),
            ty: prev.ty,
        };
        cx.append(
            src,
            &guard,
            StepKind::Assignment {
                lhs,
                ty: prev.ty,
                rhs,
                hidden,
            },
        )?;
        cx.store.set(name.clone(), binding);
        Ok(())
    }

    /// Type an expression has on its own, if any
    fn natural_type(&self, cx: &StepContext<'_>, expr: &Expr) -> Option<Type> {
        let locals = self.frames.last().map(|f| &f.locals);
        let program = cx.program;
        expr.natural_type(&|s: &SymbolId| {
            locals
                .and_then(|l| l.get(s))
                .map(|b| b.ty)
                .or_else(|| program.global(s).map(|g| g.ty))
        })
    }

    /// Translate `expr` into a term, converted to `expected` when given
    pub(crate) fn eval(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        expr: &Expr,
        expected: Option<Type>,
    ) -> Result<(Term, Type), SymexError> {
        let (term, ty) = self.eval_natural(cx, src, expr, expected)?;
        match expected {
            Some(want) => Ok((coerce(term, ty, want), want)),
            None => Ok((term, ty)),
        }
    }

    fn eval_natural(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        expr: &Expr,
        expected: Option<Type>,
    ) -> Result<(Term, Type), SymexError> {
        match expr {
            Expr::Symbol(s) => self.read(cx, src, s),
            Expr::Literal(v) => {
                let ty = match expected {
                    Some(t) if t.is_integer() => t,
                    Some(t) if t.is_boolean() => Type::Bool,
                    _ => Type::I32,
                };
                Ok((literal(*v, ty), ty))
            }
            Expr::Bool(b) => Ok((Term::bool(*b), Type::Bool)),
            Expr::Nondet(ty) => {
                let ty = (*ty).or(expected).unwrap_or(Type::I32);
                Ok((cx.names.fresh_nondet(ty), ty))
            }
            Expr::Unary { op, arg } => match op {
                UnaryOp::Not => {
                    let (a, _) = self.eval(cx, src, arg, Some(Type::Bool))?;
                    Ok((Term::not(a), Type::Bool))
                }
                UnaryOp::BitNot => {
                    let ty = self.natural_type(cx, arg).or(expected).unwrap_or(Type::I32);
                    let (a, _) = self.eval(cx, src, arg, Some(ty))?;
                    if ty.is_boolean() {
                        Ok((Term::not(a), Type::Bool))
                    } else {
                        Ok((Term::bv_unary(BvUnaryOp::Not, a), ty))
                    }
                }
                UnaryOp::Neg => {
                    let mut ty = self.natural_type(cx, arg).or(expected).unwrap_or(Type::I32);
                    if ty.is_boolean() {
                        ty = Type::I32;
                    }
                    let (a, _) = self.eval(cx, src, arg, Some(ty))?;
                    if cx.config.overflow_check && ty.is_signed() {
                        let w = a.width();
                        let min = Term::bv(1u64 << (w - 1), w);
                        self.claim(cx, src, Term::not(Term::eq(a.clone(), min)), "arithmetic overflow on unary minus")?;
                    }
                    Ok((Term::bv_unary(BvUnaryOp::Neg, a), ty))
                }
            },
            Expr::Binary { op, lhs, rhs } => self.eval_binary(cx, src, *op, lhs, rhs, expected),
            Expr::Ite { cond, then, els } => {
                let (c, _) = self.eval(cx, src, cond, Some(Type::Bool))?;
                let ty = self
                    .natural_type(cx, then)
                    .or_else(|| self.natural_type(cx, els))
                    .or(expected)
                    .unwrap_or(Type::I32);
                let (t, _) = self.eval(cx, src, then, Some(ty))?;
                let (e, _) = self.eval(cx, src, els, Some(ty))?;
                Ok((Term::ite(c, t, e), ty))
            }
            Expr::Cast { ty, arg } => {
                let from = self.natural_type(cx, arg).unwrap_or(*ty);
                let (a, _) = self.eval(cx, src, arg, Some(from))?;
                Ok((coerce(a, from, *ty), *ty))
            }
            Expr::Byte { arg, index } => {
                let ty = self.natural_type(cx, arg).unwrap_or(Type::I32);
                let end = index.checked_add(1).and_then(|n| n.checked_mul(8));
                let width = match (ty.width(), end) {
                    (Some(w), Some(end)) if w % 8 == 0 && end <= w => w,
                    _ => {
                        return Err(self.type_error(
                            src,
                            format!("byte {} is out of range for a value of type {}", index, ty),
                        ));
                    }
                };
                let (a, _) = self.eval(cx, src, arg, Some(ty))?;
                let (high, low) = match cx.config.endianness {
                    Endianness::Little => (8 * index + 7, 8 * index),
                    Endianness::Big => (width - 1 - 8 * index, width - 8 - 8 * index),
                };
                Ok((Term::extract(high, low, a), Type::int(8, false)))
            }
        }
    }

    fn eval_binary(
        &mut self,
        cx: &mut StepContext<'_>,
        src: &StepSource,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        expected: Option<Type>,
    ) -> Result<(Term, Type), SymexError> {
        let nat_l = self.natural_type(cx, lhs);
        let nat_r = self.natural_type(cx, rhs);

        if op.is_logical() {
            let (a, _) = self.eval(cx, src, lhs, Some(Type::Bool))?;
            let (b, _) = self.eval(cx, src, rhs, Some(Type::Bool))?;
            let t = match op {
                BinaryOp::And => Term::and([a, b]),
                _ => Term::or([a, b]),
            };
            return Ok((t, Type::Bool));
        }

        if op.is_comparison() {
            let mut ty = nat_l.or(nat_r).unwrap_or(Type::I32);
            let ordered = !matches!(op, BinaryOp::Eq | BinaryOp::Ne);
            if ty.is_boolean() {
                ty = if ordered { Type::int(1, false) } else { Type::Bool };
            }
            let (a, _) = self.eval(cx, src, lhs, Some(ty))?;
            let (b, _) = self.eval(cx, src, rhs, Some(ty))?;
            let (lt, le) = if ty.is_signed() {
                (BvCompareOp::Slt, BvCompareOp::Sle)
            } else {
                (BvCompareOp::Ult, BvCompareOp::Ule)
            };
            let t = match op {
                BinaryOp::Eq => Term::eq(a, b),
                BinaryOp::Ne => Term::not(Term::eq(a, b)),
                BinaryOp::Lt => Term::bv_compare(lt, a, b),
                BinaryOp::Le => Term::bv_compare(le, a, b),
                BinaryOp::Gt => Term::bv_compare(lt, b, a),
                _ => Term::bv_compare(le, b, a),
            };
            return Ok((t, Type::Bool));
        }

        if op.is_shift() {
            let mut ty = nat_l.or(expected).unwrap_or(Type::I32);
            if ty.is_boolean() {
                ty = Type::I32;
            }
            let (a, _) = self.eval(cx, src, lhs, Some(ty))?;
            let (b, _) = self.eval(cx, src, rhs, Some(ty))?;
            let bv_op = match op {
                BinaryOp::Shl => BvBinaryOp::Shl,
                _ if ty.is_signed() => BvBinaryOp::Ashr,
                _ => BvBinaryOp::Lshr,
            };
            return Ok((Term::bv_binary(bv_op, a, b), ty));
        }

        let mut ty = nat_l.or(nat_r).or(expected).unwrap_or(Type::I32);
        if ty.is_boolean() {
            if matches!(op, BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor) {
                let (a, _) = self.eval(cx, src, lhs, Some(Type::Bool))?;
                let (b, _) = self.eval(cx, src, rhs, Some(Type::Bool))?;
                let t = match op {
                    BinaryOp::BitAnd => Term::and([a, b]),
                    BinaryOp::BitOr => Term::or([a, b]),
                    _ => Term::not(Term::eq(a, b)),
                };
                return Ok((t, Type::Bool));
            }
            ty = Type::I32;
        }
        let (a, _) = self.eval(cx, src, lhs, Some(ty))?;
        let (b, _) = self.eval(cx, src, rhs, Some(ty))?;
        let signed = ty.is_signed();
        let bv_op = match op {
            BinaryOp::Add => BvBinaryOp::Add,
            BinaryOp::Sub => BvBinaryOp::Sub,
            BinaryOp::Mul => BvBinaryOp::Mul,
            BinaryOp::Div if signed => BvBinaryOp::Sdiv,
            BinaryOp::Div => BvBinaryOp::Udiv,
            BinaryOp::Rem if signed => BvBinaryOp::Srem,
            BinaryOp::Rem => BvBinaryOp::Urem,
            BinaryOp::BitAnd => BvBinaryOp::And,
            BinaryOp::BitOr => BvBinaryOp::Or,
            _ => BvBinaryOp::Xor,
        };
        let width = a.width();
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && cx.config.div_by_zero_check {
            let nonzero = Term::not(Term::eq(b.clone(), Term::bv(0, width)));
            self.claim(cx, src, nonzero, "division by zero")?;
        }
        if cx.config.overflow_check && signed && op != BinaryOp::Rem {
            if let Some(ok) = no_overflow(bv_op, &a, &b, width) {
                self.claim(cx, src, ok, &format!("arithmetic overflow on {}", op.token()))?;
            }
        }
        Ok((Term::bv_binary(bv_op, a, b), ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce() {
        let x = Term::symbol("x", crate::smt::Sort::BitVec(8));
        assert_eq!(coerce(x.clone(), Type::int(8, true), Type::int(8, false)), x);
        assert_eq!(coerce(Term::bv(0xff, 8), Type::int(8, true), Type::I32), Term::bv(u64::MAX, 32));
        assert_eq!(coerce(Term::bv(0xff, 8), Type::int(8, false), Type::I32), Term::bv(0xff, 32));
        assert_eq!(coerce(Term::bv(0x1234, 16), Type::int(16, false), Type::int(8, false)), Term::bv(0x34, 8));
        assert_eq!(coerce(Term::tt(), Type::Bool, Type::I32), Term::bv(1, 32));
        assert_eq!(coerce(Term::bv(0, 32), Type::I32, Type::Bool), Term::ff());
    }

    #[test]
    fn test_no_overflow_conditions() {
        let max = Term::bv(0x7f, 8);
        let one = Term::bv(1, 8);
        assert_eq!(no_overflow(BvBinaryOp::Add, &max, &one, 8), Some(Term::ff()));
        assert_eq!(no_overflow(BvBinaryOp::Add, &one, &one, 8), Some(Term::tt()));
        assert_eq!(no_overflow(BvBinaryOp::Mul, &Term::bv(16, 8), &Term::bv(8, 8), 8), Some(Term::ff()));
        let min = Term::bv(0x80, 8);
        let minus_one = Term::bv(0xff, 8);
        assert_eq!(no_overflow(BvBinaryOp::Sdiv, &min, &minus_one, 8), Some(Term::ff()));
        assert_eq!(no_overflow(BvBinaryOp::Urem, &min, &minus_one, 8), None);
    }

    #[test]
    fn test_no_overflow_at_full_width() {
        let max = Term::bv(i64::MAX as u64, 64);
        let one = Term::bv(1, 64);
        assert_eq!(no_overflow(BvBinaryOp::Add, &one, &max, 64), Some(Term::ff()));
        assert_eq!(no_overflow(BvBinaryOp::Sub, &Term::bv(0, 64), &Term::bv(1 << 63, 64), 64), Some(Term::ff()));
        assert_eq!(no_overflow(BvBinaryOp::Sub, &max, &one, 64), Some(Term::tt()));
        assert_eq!(
            no_overflow(BvBinaryOp::Mul, &Term::bv(1 << 62, 64), &Term::bv(4, 64), 64),
            Some(Term::ff())
        );
        assert_eq!(
            no_overflow(BvBinaryOp::Mul, &Term::bv(1 << 63, 64), &Term::bv(u64::MAX, 64), 64),
            Some(Term::ff())
        );
        // -3 * 5 fits in 40 bits, 2^20 * 2^20 does not
        let minus_three = Term::bv(0xff_ffff_fffd, 40);
        assert_eq!(no_overflow(BvBinaryOp::Mul, &minus_three, &Term::bv(5, 40), 40), Some(Term::tt()));
        assert_eq!(
            no_overflow(BvBinaryOp::Mul, &Term::bv(1 << 20, 40), &Term::bv(1 << 20, 40), 40),
            Some(Term::ff())
        );
    }

    #[test]
    fn test_no_overflow_evaluates_under_a_model() {
        let a = Term::symbol("a", crate::smt::Sort::BitVec(64));
        let b = Term::symbol("b", crate::smt::Sort::BitVec(64));
        let model = |name: &str| match name {
            "a" => Some(Value::bv(1, 64)),
            "b" => Some(Value::bv(i64::MAX as u64, 64)),
            _ => None,
        };
        let add = no_overflow(BvBinaryOp::Add, &a, &b, 64).expect("add is checked");
        assert_eq!(add.eval(&model), Some(Value::Bool(false)));
        let mul = no_overflow(BvBinaryOp::Mul, &a, &b, 64).expect("mul is checked");
        assert_eq!(mul.eval(&model), Some(Value::Bool(true)));
    }

    #[test]
    fn test_step_outcome_switch_points() {
        assert!(StepOutcome::Blocked.is_switch_point());
        assert!(StepOutcome::Finished.is_switch_point());
        assert!(!StepOutcome::Executed { switch_point: false }.is_switch_point());
    }
}
