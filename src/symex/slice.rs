//! Backward dependency slicing
//!
//! Walks the equation from the end and keeps an assignment only if its
//! left-hand side is read by something kept later: an assumption, an
//! assertion, a guard, or another kept assignment.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::smt::Term;
use crate::symex::equation::{Equation, StepKind};

fn collect(term: &Term, into: &mut HashSet<String>) {
    let mut symbols = BTreeMap::new();
    term.collect_symbols(&mut symbols);
    into.extend(symbols.into_keys());
}

/// Mark irrelevant assignments as ignored; returns how many were sliced away
pub fn slice(equation: &mut Equation) -> usize {
    let mut relevant: HashSet<String> = HashSet::new();

    for step in equation.steps().iter().filter(|s| !s.ignored) {
        match &step.kind {
            StepKind::Assume { cond } | StepKind::Assert { cond, .. } => {
                collect(cond, &mut relevant);
                collect(&step.guard, &mut relevant);
            }
            StepKind::Assignment { .. } => {}
        }
    }

    let mut sliced = 0;
    for step in equation.steps_mut().iter_mut().rev() {
        if step.ignored {
            continue;
        }
        if let StepKind::Assignment { lhs, rhs, .. } = &step.kind {
            if relevant.contains(&lhs.to_string()) {
                collect(rhs, &mut relevant);
            } else {
                step.ignored = true;
                sliced += 1;
            }
        }
    }
    debug!(sliced, remaining = equation.len() - equation.ignored(), "sliced equation");
    sliced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Location, SymbolId, Type};
    use crate::smt::BvBinaryOp;
    use crate::symex::equation::{EquationBuilder, StepSource};
    use crate::symex::store::SsaName;

    fn assign(b: &mut EquationBuilder, l1: &str, version: u32, rhs: Term) -> Term {
        let lhs = SsaName {
            original: SymbolId::new(l1),
            l1: l1.to_string(),
            version,
        };
        let sym = lhs.symbol(Type::I32);
        b.append(
            0,
            Term::tt(),
            StepKind::Assignment {
                lhs,
                ty: Type::I32,
                rhs,
                hidden: false,
            },
            StepSource {
                thread: 0,
                function: SymbolId::new("main"),
                location: Location::new(1),
            },
        )
        .unwrap();
        sym
    }

    #[test]
    fn test_unrelated_assignments_are_sliced() {
        let mut b = EquationBuilder::new();
        b.open_contributor(0).unwrap();
        let a = assign(&mut b, "a", 1, Term::bv(1, 32));
        let _unused = assign(&mut b, "u", 1, Term::bv(9, 32));
        let c = assign(
            &mut b,
            "c",
            1,
            Term::bv_binary(BvBinaryOp::Add, a, Term::symbol("n", crate::smt::Sort::BitVec(32))),
        );
        b.append(
            0,
            Term::tt(),
            StepKind::Assert {
                cond: Term::eq(c, Term::bv(3, 32)),
                comment: String::new(),
            },
            StepSource {
                thread: 0,
                function: SymbolId::new("main"),
                location: Location::new(2),
            },
        )
        .unwrap();
        let mut eq = b.freeze().unwrap();
        assert_eq!(slice(&mut eq), 1);
        assert!(eq.steps()[1].ignored);
        assert!(!eq.steps()[0].ignored);
        assert!(!eq.steps()[2].ignored);
        assert!(!eq.to_string().contains("u#1"));
    }
}
