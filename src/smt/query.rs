//! Solver-independent encoding of one closed equation

use std::collections::BTreeMap;

use crate::smt::sort::{Sort, Value};
use crate::smt::term::Term;

/// One property to check: `assumptions -> (guard -> cond)`
#[derive(Debug, Clone)]
pub struct Claim {
    /// Index of the originating step in the equation
    pub step: usize,
    pub comment: String,
    pub guard: Term,
    pub cond: Term,
    /// Conjunction of every assumption preceding the claim
    pub assumptions: Term,
    pub term: Term,
}

/// Satisfying assignment of a query's free symbols
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Witness {
    values: BTreeMap<String, Value>,
}

impl Witness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn eval(&self, term: &Term) -> Option<Value> {
        term.eval(&|name| self.get(name))
    }

    pub fn eval_bool(&self, term: &Term) -> Option<bool> {
        self.eval(term).and_then(|v| v.as_bool())
    }
}

/// Ordered set of formulas whose satisfiability means "some claim fails".
///
/// `assertions` holds the definitional part (SSA equalities and program
/// constraints); the goal is the negated conjunction of all claims.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub declarations: BTreeMap<String, Sort>,
    pub assertions: Vec<Term>,
    pub claims: Vec<Claim>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert(&mut self, term: Term) {
        if term.is_true() {
            return;
        }
        term.collect_symbols(&mut self.declarations);
        self.assertions.push(term);
    }

    /// Record a claim. Claims that fold to `true` can never fail and are
    /// dropped; returns whether the claim was kept.
    pub fn add_claim(
        &mut self,
        step: usize,
        comment: &str,
        guard: Term,
        cond: Term,
        assumptions: Term,
    ) -> bool {
        let term = Term::implies(
            assumptions.clone(),
            Term::implies(guard.clone(), cond.clone()),
        );
        if term.is_true() {
            return false;
        }
        term.collect_symbols(&mut self.declarations);
        self.claims.push(Claim {
            step,
            comment: comment.to_string(),
            guard,
            cond,
            assumptions,
            term,
        });
        true
    }

    pub fn has_claims(&self) -> bool {
        !self.claims.is_empty()
    }

    pub fn goal(&self) -> Term {
        Term::not(Term::and(self.claims.iter().map(|c| c.term.clone())))
    }

    /// Every formula a backend must assert, goal last
    pub fn formulas(&self) -> Vec<Term> {
        let mut out = self.assertions.clone();
        out.push(self.goal());
        out
    }

    /// Whether `witness` satisfies every formula of the query
    pub fn holds_under(&self, witness: &Witness) -> bool {
        self.formulas()
            .iter()
            .all(|f| witness.eval_bool(f) == Some(true))
    }

    /// Claims that evaluate to false under `witness`, in program order
    pub fn violated_claims(&self, witness: &Witness) -> Vec<&Claim> {
        self.claims
            .iter()
            .filter(|c| witness.eval_bool(&c.term) == Some(false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::term::{BvBinaryOp, BvCompareOp};

    #[test]
    fn test_trivial_claims_dropped() {
        let mut q = Query::new();
        assert!(!q.add_claim(0, "trivial", Term::tt(), Term::tt(), Term::tt()));
        assert!(!q.has_claims());
        assert!(q.goal().is_false());
    }

    #[test]
    fn test_holds_under_witness() {
        let x = Term::symbol("x#1", Sort::BitVec(8));
        let y = Term::symbol("y#1", Sort::BitVec(8));
        let mut q = Query::new();
        q.assert(Term::eq(
            y.clone(),
            Term::bv_binary(BvBinaryOp::Add, x.clone(), Term::bv(1, 8)),
        ));
        q.add_claim(
            1,
            "y is not zero",
            Term::tt(),
            Term::not(Term::eq(y.clone(), Term::bv(0, 8))),
            Term::tt(),
        );
        assert_eq!(q.declarations.len(), 2);

        let mut w = Witness::new();
        w.insert("x#1", Value::bv(0xff, 8));
        w.insert("y#1", Value::bv(0, 8));
        assert!(q.holds_under(&w));
        assert_eq!(q.violated_claims(&w).len(), 1);

        let mut w = Witness::new();
        w.insert("x#1", Value::bv(1, 8));
        w.insert("y#1", Value::bv(2, 8));
        assert!(!q.holds_under(&w));
    }

    #[test]
    fn test_assumptions_weaken_claim() {
        let x = Term::symbol("x", Sort::BitVec(8));
        let assume = Term::bv_compare(BvCompareOp::Ult, x.clone(), Term::bv(5, 8));
        let cond = Term::bv_compare(BvCompareOp::Ult, x.clone(), Term::bv(10, 8));
        let mut q = Query::new();
        q.add_claim(0, "bounded", Term::tt(), cond, assume);
        let mut w = Witness::new();
        w.insert("x", Value::bv(20, 8));
        // assumption is violated, so the claim holds vacuously
        assert!(q.violated_claims(&w).is_empty());
    }
}
