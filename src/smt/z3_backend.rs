//! In-process Z3 backend

use std::collections::HashMap;

use tracing::debug;
use z3::ast::{BV, Bool};
use z3::{Params, Solver};

use crate::smt::query::{Query, Witness};
use crate::smt::sort::{Sort, Value};
use crate::smt::term::{BvBinaryOp, BvCompareOp, BvUnaryOp, Term, TermKind};
use crate::smt::{SatResult, SolverBackend, SolverConfig, SolverError};

/// Create a Z3 solver with the given configuration
pub fn create_solver_with_config(cfg: &SolverConfig) -> Solver {
    let solver = Solver::new();
    if let Some(timeout) = cfg.timeout {
        let mut params = Params::new();
        params.set_u32("timeout", timeout.as_millis() as u32);
        solver.set_params(&params);
    }
    solver
}

#[derive(Clone)]
enum Z3Term {
    Bool(Bool),
    Bv(BV),
}

impl Z3Term {
    fn into_bool(self) -> Result<Bool, SolverError> {
        match self {
            Z3Term::Bool(b) => Ok(b),
            Z3Term::Bv(_) => Err(SolverError::IllSorted(
                "expected Bool, found bit-vector".into(),
            )),
        }
    }

    fn into_bv(self) -> Result<BV, SolverError> {
        match self {
            Z3Term::Bv(b) => Ok(b),
            Z3Term::Bool(_) => Err(SolverError::IllSorted(
                "expected bit-vector, found Bool".into(),
            )),
        }
    }
}

pub struct Z3Backend {
    config: SolverConfig,
    solver: Option<Solver>,
    symbols: Vec<(String, Sort, Z3Term)>,
    last_result: Option<SatResult>,
}

impl Z3Backend {
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            config: config.clone(),
            solver: None,
            symbols: Vec::new(),
            last_result: None,
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(&SolverConfig::default())
    }

    fn translate(
        term: &Term,
        symbols: &HashMap<&str, Z3Term>,
        cache: &mut HashMap<usize, Z3Term>,
    ) -> Result<Z3Term, SolverError> {
        if let Some(done) = cache.get(&term.id()) {
            return Ok(done.clone());
        }
        let mut sub = |t: &Term| Self::translate(t, symbols, cache);
        let out = match term.kind() {
            TermKind::BoolConst(b) => Z3Term::Bool(Bool::from_bool(*b)),
            TermKind::BvConst { value, width } => Z3Term::Bv(BV::from_u64(*value, *width)),
            TermKind::Symbol { name, .. } => symbols
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| SolverError::IllSorted(format!("undeclared symbol {}", name)))?,
            TermKind::Not(a) => Z3Term::Bool(sub(a)?.into_bool()?.not()),
            TermKind::And(args) | TermKind::Or(args) => {
                let bools = args
                    .iter()
                    .map(|a| sub(a).and_then(Z3Term::into_bool))
                    .collect::<Result<Vec<_>, _>>()?;
                let refs: Vec<&Bool> = bools.iter().collect();
                if matches!(term.kind(), TermKind::And(_)) {
                    Z3Term::Bool(Bool::and(&refs))
                } else {
                    Z3Term::Bool(Bool::or(&refs))
                }
            }
            TermKind::Implies(a, b) => {
                let a = sub(a)?.into_bool()?;
                let b = sub(b)?.into_bool()?;
                Z3Term::Bool(a.implies(&b))
            }
            TermKind::Eq(a, b) => match (sub(a)?, sub(b)?) {
                (Z3Term::Bool(x), Z3Term::Bool(y)) => Z3Term::Bool(x.eq(&y)),
                (Z3Term::Bv(x), Z3Term::Bv(y)) => Z3Term::Bool(x.eq(&y)),
                _ => return Err(SolverError::IllSorted(format!("{}", term))),
            },
            TermKind::Ite(c, t, e) => {
                let c = sub(c)?.into_bool()?;
                match (sub(t)?, sub(e)?) {
                    (Z3Term::Bool(x), Z3Term::Bool(y)) => Z3Term::Bool(c.ite(&x, &y)),
                    (Z3Term::Bv(x), Z3Term::Bv(y)) => Z3Term::Bv(c.ite(&x, &y)),
                    _ => return Err(SolverError::IllSorted(format!("{}", term))),
                }
            }
            TermKind::BvUnary(op, a) => {
                let a = sub(a)?.into_bv()?;
                Z3Term::Bv(match op {
                    BvUnaryOp::Not => a.bvnot(),
                    BvUnaryOp::Neg => a.bvneg(),
                })
            }
            TermKind::BvBinary(op, a, b) => {
                let a = sub(a)?.into_bv()?;
                let b = sub(b)?.into_bv()?;
                Z3Term::Bv(match op {
                    BvBinaryOp::Add => a.bvadd(&b),
                    BvBinaryOp::Sub => a.bvsub(&b),
                    BvBinaryOp::Mul => a.bvmul(&b),
                    BvBinaryOp::Udiv => a.bvudiv(&b),
                    BvBinaryOp::Sdiv => a.bvsdiv(&b),
                    BvBinaryOp::Urem => a.bvurem(&b),
                    BvBinaryOp::Srem => a.bvsrem(&b),
                    BvBinaryOp::And => a.bvand(&b),
                    BvBinaryOp::Or => a.bvor(&b),
                    BvBinaryOp::Xor => a.bvxor(&b),
                    BvBinaryOp::Shl => a.bvshl(&b),
                    BvBinaryOp::Lshr => a.bvlshr(&b),
                    BvBinaryOp::Ashr => a.bvashr(&b),
                })
            }
            TermKind::BvCompare(op, a, b) => {
                let a = sub(a)?.into_bv()?;
                let b = sub(b)?.into_bv()?;
                Z3Term::Bool(match op {
                    BvCompareOp::Ult => a.bvult(&b),
                    BvCompareOp::Ule => a.bvule(&b),
                    BvCompareOp::Slt => a.bvslt(&b),
                    BvCompareOp::Sle => a.bvsle(&b),
                })
            }
            TermKind::Extract { high, low, arg } => {
                Z3Term::Bv(sub(arg)?.into_bv()?.extract(*high, *low))
            }
            TermKind::ZeroExt { extra, arg } => Z3Term::Bv(sub(arg)?.into_bv()?.zero_ext(*extra)),
            TermKind::SignExt { extra, arg } => Z3Term::Bv(sub(arg)?.into_bv()?.sign_ext(*extra)),
        };
        cache.insert(term.id(), out.clone());
        Ok(out)
    }
}

impl SolverBackend for Z3Backend {
    fn name(&self) -> String {
        "z3".to_string()
    }

    fn convert(&mut self, query: &Query) -> Result<(), SolverError> {
        let solver = create_solver_with_config(&self.config);
        let mut symbols = Vec::with_capacity(query.declarations.len());
        for (name, sort) in &query.declarations {
            let ast = match sort {
                Sort::Bool => Z3Term::Bool(Bool::new_const(name.as_str())),
                Sort::BitVec(w) => Z3Term::Bv(BV::new_const(name.as_str(), *w)),
            };
            symbols.push((name.clone(), *sort, ast));
        }

        let by_name: HashMap<&str, Z3Term> = symbols
            .iter()
            .map(|(n, _, t)| (n.as_str(), t.clone()))
            .collect();
        let mut cache = HashMap::new();
        let formulas = query.formulas();
        for f in &formulas {
            let b = Self::translate(f, &by_name, &mut cache)?.into_bool()?;
            solver.assert(&b);
        }
        debug!(
            symbols = symbols.len(),
            formulas = formulas.len(),
            "converted query for z3"
        );

        self.solver = Some(solver);
        self.symbols = symbols;
        self.last_result = None;
        Ok(())
    }

    fn dec_solve(&mut self) -> Result<SatResult, SolverError> {
        let solver = self.solver.as_ref().ok_or(SolverError::NotConverted)?;
        let result = match solver.check() {
            z3::SatResult::Sat => SatResult::Sat,
            z3::SatResult::Unsat => SatResult::Unsat,
            z3::SatResult::Unknown => SatResult::Unknown(
                solver
                    .get_reason_unknown()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
        };
        self.last_result = Some(result.clone());
        Ok(result)
    }

    fn witness(&mut self) -> Result<Option<Witness>, SolverError> {
        if self.last_result != Some(SatResult::Sat) {
            return Ok(None);
        }
        let solver = self.solver.as_ref().ok_or(SolverError::NotConverted)?;
        let Some(model) = solver.get_model() else {
            return Ok(None);
        };
        let mut witness = Witness::new();
        for (name, sort, ast) in &self.symbols {
            let value = match (ast, sort) {
                (Z3Term::Bool(b), _) => model
                    .eval(b, true)
                    .and_then(|v| v.as_bool())
                    .map(Value::Bool),
                (Z3Term::Bv(b), Sort::BitVec(w)) => model
                    .eval(b, true)
                    .and_then(|v| v.as_u64())
                    .map(|v| Value::bv(v, *w)),
                (Z3Term::Bv(_), Sort::Bool) => None,
            };
            match value {
                Some(v) => witness.insert(name.clone(), v),
                None => {
                    return Err(SolverError::Backend {
                        solver: self.name(),
                        message: format!("model has no value for {}", name),
                    })
                }
            }
        }
        Ok(Some(witness))
    }
}
