//! Counterexamples reconstructed from a solver witness

use std::fmt;

use crate::ir::{Location, SymbolId, Type};
use crate::smt::sort::to_signed;
use crate::smt::{Query, Value, Witness};
use crate::symex::{Equation, StepKind, SwitchRecord};

/// One visible assignment along the failing path
#[derive(Debug, Clone, PartialEq)]
pub struct TraceStep {
    pub thread: usize,
    pub function: SymbolId,
    pub location: Location,
    pub variable: SymbolId,
    /// SSA name of the assigned version
    pub ssa: String,
    pub ty: Type,
    pub value: Option<Value>,
}

/// The property that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub comment: String,
    pub thread: usize,
    pub function: SymbolId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Counterexample {
    pub violation: Violation,
    pub steps: Vec<TraceStep>,
    pub schedule: Vec<SwitchRecord>,
}

/// Render a value the way the program declared it
pub fn format_value(value: Value, ty: Type) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Bv { value, width } if ty.is_signed() => {
            format!("{} ({})", to_signed(value, width), value_bits(value, width))
        }
        Value::Bv { value, width } => format!("{} ({})", value, value_bits(value, width)),
    }
}

fn value_bits(value: u64, width: u32) -> String {
    Value::bv(value, width).bit_string()
}

impl Counterexample {
    /// Rebuild the failing path of `equation` under `witness`. Returns
    /// `None` when no claim of `query` is violated by the witness.
    pub fn build(
        equation: &Equation,
        query: &Query,
        witness: &Witness,
        schedule: &[SwitchRecord],
    ) -> Option<Self> {
        let claim = query.violated_claims(witness).into_iter().next()?;
        let failing = equation.steps().get(claim.step)?;
        let violation = Violation {
            comment: claim.comment.clone(),
            thread: failing.source.thread,
            function: failing.source.function.clone(),
            location: failing.source.location,
        };

        let mut steps = Vec::new();
        for step in &equation.steps()[..claim.step] {
            if step.ignored {
                continue;
            }
            let StepKind::Assignment {
                lhs,
                ty,
                rhs,
                hidden: false,
            } = &step.kind
            else {
                continue;
            };
            if witness.eval_bool(&step.guard) != Some(true) {
                continue;
            }
            let ssa = lhs.to_string();
            let value = witness.get(&ssa).or_else(|| witness.eval(rhs));
            steps.push(TraceStep {
                thread: step.source.thread,
                function: step.source.function.clone(),
                location: step.source.location,
                variable: lhs.original.clone(),
                ssa,
                ty: *ty,
                value,
            });
        }
        Some(Self {
            violation,
            steps,
            schedule: schedule.to_vec(),
        })
    }

    /// Threads that appear in the trace, in order of first appearance
    pub fn threads(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for t in self.steps.iter().map(|s| s.thread).chain([self.violation.thread]) {
            if !out.contains(&t) {
                out.push(t);
            }
        }
        out
    }
}

impl fmt::Display for Counterexample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Counterexample:")?;
        let mut thread = None;
        for step in &self.steps {
            if thread != Some(step.thread) {
                writeln!(f)?;
                writeln!(f, "State: thread {}, function {}, {}", step.thread, step.function, step.location)?;
                thread = Some(step.thread);
            }
            match step.value {
                Some(v) => writeln!(f, "  {} = {}", step.variable, format_value(v, step.ty))?,
                None => writeln!(f, "  {} = ?", step.variable)?,
            }
        }
        if !self.schedule.is_empty() {
            writeln!(f)?;
            writeln!(f, "Schedule:")?;
            for switch in &self.schedule {
                writeln!(f, "  {}", switch)?;
            }
        }
        writeln!(f)?;
        writeln!(
            f,
            "Violated property: {} (thread {}, function {}, {})",
            self.violation.comment, self.violation.thread, self.violation.function, self.violation.location
        )
    }
}
