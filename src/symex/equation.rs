//! The symbolic execution equation
//!
//! [`EquationBuilder`] is the append-only trace shared by every thread of a
//! path. Only open contributors may append, and nothing may be appended once
//! the builder is frozen into an [`Equation`].

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::ir::{Location, SymbolId, Type};
use crate::smt::{Query, SolverBackend, SolverError, Term};
use crate::symex::store::SsaName;

/// Broken engine invariant. Never caused by the input program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("append to a closed equation")]
    EquationClosed,
    #[error("thread {thread} already finished its contribution")]
    ContributorFinished { thread: usize },
    #[error("thread {thread} never joined the equation")]
    UnknownContributor { thread: usize },
    #[error("thread {thread} is retired and cannot step")]
    RetiredState { thread: usize },
    #[error("{operation} is not allowed while {phase}")]
    OutOfPhase {
        operation: &'static str,
        phase: String,
    },
}

/// Where a step came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSource {
    pub thread: usize,
    pub function: SymbolId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Assignment {
        lhs: SsaName,
        ty: Type,
        rhs: Term,
        /// Bookkeeping (phi, parameter passing, initialisation)
        hidden: bool,
    },
    Assume {
        cond: Term,
    },
    Assert {
        cond: Term,
        comment: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SsaStep {
    pub guard: Term,
    pub kind: StepKind,
    pub source: StepSource,
    /// Set by the slicer; ignored steps are not encoded
    pub ignored: bool,
}

impl SsaStep {
    pub fn is_assert(&self) -> bool {
        matches!(self.kind, StepKind::Assert { .. })
    }

    /// An assertion whose guarded condition does not fold to true
    pub fn is_open_claim(&self) -> bool {
        match &self.kind {
            StepKind::Assert { cond, .. } => {
                !self.ignored && !Term::implies(self.guard.clone(), cond.clone()).is_true()
            }
            _ => false,
        }
    }
}

/// Restore point for backtracking
#[derive(Debug, Clone)]
pub struct Checkpoint {
    len: usize,
    open: BTreeSet<usize>,
    finished: BTreeSet<usize>,
}

#[derive(Debug, Default)]
pub struct EquationBuilder {
    steps: Vec<SsaStep>,
    open: BTreeSet<usize>,
    finished: BTreeSet<usize>,
    closed: bool,
}

impl EquationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn steps(&self) -> &[SsaStep] {
        &self.steps
    }

    pub fn open_contributor(&mut self, thread: usize) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::EquationClosed);
        }
        if self.finished.contains(&thread) {
            return Err(ProtocolError::ContributorFinished { thread });
        }
        self.open.insert(thread);
        Ok(())
    }

    /// Close one thread's contribution. Closing twice is harmless.
    pub fn close_contributor(&mut self, thread: usize) {
        if self.open.remove(&thread) {
            self.finished.insert(thread);
        }
    }

    pub fn is_open(&self, thread: usize) -> bool {
        self.open.contains(&thread)
    }

    /// Record one guarded effect; returns its index
    pub fn append(
        &mut self,
        thread: usize,
        guard: Term,
        kind: StepKind,
        source: StepSource,
    ) -> Result<usize, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::EquationClosed);
        }
        if !self.open.contains(&thread) {
            if self.finished.contains(&thread) {
                return Err(ProtocolError::ContributorFinished { thread });
            }
            return Err(ProtocolError::UnknownContributor { thread });
        }
        self.steps.push(SsaStep {
            guard,
            kind,
            source,
            ignored: false,
        });
        Ok(self.steps.len() - 1)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.steps.len(),
            open: self.open.clone(),
            finished: self.finished.clone(),
        }
    }

    /// Roll back to `checkpoint` and reopen the builder
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        self.steps.truncate(checkpoint.len);
        self.open = checkpoint.open.clone();
        self.finished = checkpoint.finished.clone();
        self.closed = false;
    }

    /// Close every contributor and the builder itself, returning the
    /// immutable equation
    pub fn freeze(&mut self) -> Result<Equation, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::EquationClosed);
        }
        let open: Vec<usize> = self.open.iter().copied().collect();
        for thread in open {
            self.close_contributor(thread);
        }
        self.closed = true;
        Ok(Equation {
            steps: self.steps.clone(),
        })
    }

    /// Start over with an empty trace
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A closed equation, ready for encoding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Equation {
    steps: Vec<SsaStep>,
}

impl Equation {
    pub fn steps(&self) -> &[SsaStep] {
        &self.steps
    }

    pub(crate) fn steps_mut(&mut self) -> &mut [SsaStep] {
        &mut self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn total_claims(&self) -> usize {
        self.steps.iter().filter(|s| s.is_assert()).count()
    }

    pub fn remaining_claims(&self) -> usize {
        self.steps.iter().filter(|s| s.is_open_claim()).count()
    }

    pub fn ignored(&self) -> usize {
        self.steps.iter().filter(|s| s.ignored).count()
    }

    /// Encode and hand the result to `backend`. Returns the query so the
    /// caller can check a witness against it.
    pub fn convert(&self, backend: &mut dyn SolverBackend) -> Result<Query, SolverError> {
        let query = Query::encode(self);
        backend.convert(&query)?;
        Ok(query)
    }
}

impl Query {
    /// Ordering-sensitive encoding of an equation. Assignments become
    /// equalities; every claim is weakened by the assumptions before it.
    pub fn encode(equation: &Equation) -> Query {
        let mut query = Query::new();
        let mut assumptions = Term::tt();
        for (idx, step) in equation.steps().iter().enumerate() {
            if step.ignored {
                continue;
            }
            match &step.kind {
                StepKind::Assignment { lhs, ty, rhs, .. } => {
                    query.assert(Term::eq(lhs.symbol(*ty), rhs.clone()));
                }
                StepKind::Assume { cond } => {
                    assumptions = Term::and([
                        assumptions,
                        Term::implies(step.guard.clone(), cond.clone()),
                    ]);
                }
                StepKind::Assert { cond, comment } => {
                    query.add_claim(
                        idx,
                        comment,
                        step.guard.clone(),
                        cond.clone(),
                        assumptions.clone(),
                    );
                }
            }
        }
        query
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, step) in self.steps.iter().enumerate() {
            if step.ignored {
                continue;
            }
            write!(
                f,
                "{:>4} t{} {} {}: ",
                idx, step.source.thread, step.source.function, step.source.location
            )?;
            match &step.kind {
                StepKind::Assignment { lhs, rhs, hidden, .. } => {
                    write!(f, "{} = {}", lhs, rhs)?;
                    if *hidden {
                        write!(f, " (hidden)")?;
                    }
                }
                StepKind::Assume { cond } => write!(f, "ASSUME {}", cond)?,
                StepKind::Assert { cond, comment } => {
                    write!(f, "ASSERT {}", cond)?;
                    if !comment.is_empty() {
                        write!(f, " // {}", comment)?;
                    }
                }
            }
            if !step.guard.is_true() {
                write!(f, " [guard {}]", step.guard)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::{BvCompareOp, Sort};

    fn source() -> StepSource {
        StepSource {
            thread: 0,
            function: SymbolId::new("main"),
            location: Location::new(1),
        }
    }

    fn name(l1: &str, version: u32) -> SsaName {
        SsaName {
            original: SymbolId::new(l1),
            l1: l1.to_string(),
            version,
        }
    }

    #[test]
    fn test_append_requires_open_contributor() {
        let mut b = EquationBuilder::new();
        let err = b
            .append(0, Term::tt(), StepKind::Assume { cond: Term::tt() }, source())
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownContributor { thread: 0 });

        b.open_contributor(0).unwrap();
        assert_eq!(
            b.append(0, Term::tt(), StepKind::Assume { cond: Term::tt() }, source()),
            Ok(0)
        );
        b.close_contributor(0);
        let err = b
            .append(0, Term::tt(), StepKind::Assume { cond: Term::tt() }, source())
            .unwrap_err();
        assert_eq!(err, ProtocolError::ContributorFinished { thread: 0 });
    }

    #[test]
    fn test_frozen_builder_rejects_appends() {
        let mut b = EquationBuilder::new();
        b.open_contributor(0).unwrap();
        b.open_contributor(1).unwrap();
        let eq = b.freeze().unwrap();
        assert!(eq.is_empty());
        assert!(b.is_closed());
        assert!(!b.is_open(1));
        let err = b
            .append(1, Term::tt(), StepKind::Assume { cond: Term::tt() }, source())
            .unwrap_err();
        assert_eq!(err, ProtocolError::EquationClosed);
        assert_eq!(b.freeze().unwrap_err(), ProtocolError::EquationClosed);
    }

    #[test]
    fn test_restore_reopens() {
        let mut b = EquationBuilder::new();
        b.open_contributor(0).unwrap();
        let cp = b.checkpoint();
        b.append(0, Term::tt(), StepKind::Assume { cond: Term::tt() }, source())
            .unwrap();
        b.freeze().unwrap();
        b.restore(&cp);
        assert!(!b.is_closed());
        assert!(b.is_empty());
        assert!(b.is_open(0));
    }

    #[test]
    fn test_encode_weakens_claims_by_prior_assumptions() {
        let x = name("x", 1);
        let x_term = x.symbol(Type::int(8, false));
        let mut b = EquationBuilder::new();
        b.open_contributor(0).unwrap();
        b.append(
            0,
            Term::tt(),
            StepKind::Assignment {
                lhs: x.clone(),
                ty: Type::int(8, false),
                rhs: Term::symbol("nondet#1", Sort::BitVec(8)),
                hidden: false,
            },
            source(),
        )
        .unwrap();
        b.append(
            0,
            Term::tt(),
            StepKind::Assume {
                cond: Term::bv_compare(BvCompareOp::Ult, x_term.clone(), Term::bv(10, 8)),
            },
            source(),
        )
        .unwrap();
        b.append(
            0,
            Term::tt(),
            StepKind::Assert {
                cond: Term::bv_compare(BvCompareOp::Ult, x_term, Term::bv(20, 8)),
                comment: "x below 20".into(),
            },
            source(),
        )
        .unwrap();
        b.append(
            0,
            Term::tt(),
            StepKind::Assert {
                cond: Term::tt(),
                comment: "trivial".into(),
            },
            source(),
        )
        .unwrap();
        let eq = b.freeze().unwrap();
        assert_eq!(eq.total_claims(), 2);
        assert_eq!(eq.remaining_claims(), 1);

        let q = Query::encode(&eq);
        assert_eq!(q.assertions.len(), 1);
        assert_eq!(q.claims.len(), 1);
        assert_eq!(q.claims[0].step, 2);
        assert!(!q.claims[0].assumptions.is_true());
        assert!(eq.to_string().contains("ASSERT"));
        assert!(eq.to_string().contains("// x below 20"));
    }
}
