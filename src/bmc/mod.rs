//! Bounded model checking driver
//!
//! Explores the interleavings of a program one formula at a time, slices
//! and encodes each equation, and hands it to the configured solver
//! backends. The first satisfiable formula is a counterexample.

pub mod config;
pub mod trace;

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::ir::GotoProgram;
use crate::smt::portfolio;
use crate::smt::select::SolverSelector;
use crate::smt::smtlib::to_smtlib;
use crate::smt::{Query, SatResult};
use crate::symex::{CancellationToken, ReachabilityTree, SymexError, SymexResult, slice};

pub use config::BmcConfig;
pub use trace::{Counterexample, TraceStep, Violation};

/// Final answer of a verification run
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No explored interleaving violates a property
    Safe,
    Unsafe(Box<Counterexample>),
    /// Some formula could not be decided
    Unknown(String),
}

impl Verdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, Verdict::Safe)
    }

    pub fn is_unsafe(&self) -> bool {
        matches!(self, Verdict::Unsafe(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Safe => write!(f, "VERIFICATION SUCCESSFUL"),
            Verdict::Unsafe(_) => write!(f, "VERIFICATION FAILED"),
            Verdict::Unknown(_) => write!(f, "VERIFICATION UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BmcStatistics {
    /// Interleavings explored
    pub interleavings: usize,
    /// Interleavings whose formula was satisfiable
    pub failed: usize,
    /// Interleavings truncated by the step limit
    pub truncated: usize,
    pub ssa_steps: usize,
    pub sliced_steps: usize,
    pub claims: usize,
    pub solver_calls: usize,
    pub symex_time: Duration,
    pub solve_time: Duration,
}

impl BmcStatistics {
    pub fn print_summary(&self) {
        println!("Interleavings explored: {}", self.interleavings);
        println!("Interleavings failed:   {}", self.failed);
        if self.truncated > 0 {
            println!("Interleavings truncated: {}", self.truncated);
        }
        println!("SSA steps:              {} ({} sliced)", self.ssa_steps, self.sliced_steps);
        println!("Claims:                 {}", self.claims);
        println!("Solver calls:           {}", self.solver_calls);
        println!("Symex time:             {:.3}s", self.symex_time.as_secs_f64());
        println!("Solve time:             {:.3}s", self.solve_time.as_secs_f64());
    }
}

#[derive(Debug, Clone)]
pub struct BmcOutcome {
    pub verdict: Verdict,
    pub statistics: BmcStatistics,
}

pub struct Bmc<'p> {
    program: &'p GotoProgram,
    config: BmcConfig,
    cancel: CancellationToken,
}

impl<'p> Bmc<'p> {
    pub fn new(program: &'p GotoProgram, config: BmcConfig) -> Self {
        Self {
            program,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &BmcConfig {
        &self.config
    }

    /// Explore every interleaving (or stop at the first failure) and solve
    /// each formula
    pub fn run(&self) -> Result<BmcOutcome, SymexError> {
        let mut tree = ReachabilityTree::new(self.program, self.config.explore.clone())
            .with_cancellation(self.cancel.clone());
        let mut selector = self.config.selection.build();
        let mut stats = BmcStatistics::default();
        let mut unknown: Option<String> = None;
        let mut counterexample: Option<Counterexample> = None;

        info!(
            backends = ?self.config.backends.iter().map(|b| b.to_string()).collect::<Vec<_>>(),
            selector = selector.name(),
            policy = %self.config.explore.policy,
            "starting verification"
        );

        let start = Instant::now();
        tree.setup_for_new_explore()?;
        stats.symex_time += start.elapsed();

        loop {
            let start = Instant::now();
            let mut result = tree.get_next_formula()?;
            stats.interleavings += 1;
            if result.statistics.truncated {
                stats.truncated += 1;
            }
            if self.config.slice {
                stats.sliced_steps += slice(&mut result.equation);
            }
            stats.ssa_steps += result.equation.len();
            stats.claims += result.remaining_claims;
            stats.symex_time += start.elapsed();

            if self.config.show_program {
                println!("Interleaving {}:", stats.interleavings);
                print!("{}", result.equation);
                println!();
            }

            match self.decide(&result, selector.as_mut(), &mut stats) {
                Decided::Unsat => {}
                Decided::Sat(cex) => {
                    stats.failed += 1;
                    if counterexample.is_none() {
                        counterexample = Some(cex);
                    }
                    if !self.config.all_runs {
                        break;
                    }
                }
                Decided::Unknown(reason) => {
                    warn!(interleaving = stats.interleavings, reason = %reason, "formula undecided");
                    unknown.get_or_insert(reason);
                }
            }

            let start = Instant::now();
            let more = tree.setup_next_formula()?;
            stats.symex_time += start.elapsed();
            if !more {
                break;
            }
            if self
                .config
                .max_interleavings
                .is_some_and(|limit| stats.interleavings >= limit)
            {
                info!(interleavings = stats.interleavings, "interleaving limit reached");
                unknown.get_or_insert_with(|| {
                    format!("stopped after {} interleavings", stats.interleavings)
                });
                break;
            }
        }

        let verdict = match (counterexample, unknown) {
            (Some(cex), _) => Verdict::Unsafe(Box::new(cex)),
            (None, Some(reason)) => Verdict::Unknown(reason),
            (None, None) => Verdict::Safe,
        };
        info!(
            verdict = %verdict,
            interleavings = stats.interleavings,
            failed = stats.failed,
            "verification finished"
        );
        Ok(BmcOutcome {
            verdict,
            statistics: stats,
        })
    }

    fn decide(
        &self,
        result: &SymexResult,
        selector: &mut dyn SolverSelector,
        stats: &mut BmcStatistics,
    ) -> Decided {
        let query = Query::encode(&result.equation);
        if self.config.smt_formula_only {
            print!("{}", to_smtlib(&query));
            return Decided::Unsat;
        }
        if !query.has_claims() {
            debug!(interleaving = stats.interleavings, "no claims left, skipping solver");
            return Decided::Unsat;
        }

        let order = selector.rank(&query, &self.config.backends);
        let start = Instant::now();
        let outcome = portfolio::solve(&query, &order, &self.config.solver, &self.config.portfolio);
        stats.solve_time += start.elapsed();
        stats.solver_calls += outcome.attempts.len().max(1);
        if let Some(winner) = outcome.winner {
            selector.record_winner(winner);
        }
        debug!(
            interleaving = stats.interleavings,
            result = %outcome.result,
            winner = ?outcome.winner.map(|w| w.to_string()),
            "solved"
        );

        match outcome.result {
            SatResult::Unsat => Decided::Unsat,
            SatResult::Unknown(reason) => Decided::Unknown(reason),
            SatResult::Sat => {
                let Some(witness) = outcome.witness else {
                    return Decided::Unknown("solver answered SAT without a model".to_string());
                };
                match Counterexample::build(&result.equation, &query, &witness, &result.schedule) {
                    Some(cex) => Decided::Sat(cex),
                    None => Decided::Unknown("model violates no claim".to_string()),
                }
            }
        }
    }
}

enum Decided {
    Unsat,
    Sat(Counterexample),
    Unknown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_messages() {
        assert_eq!(Verdict::Safe.to_string(), "VERIFICATION SUCCESSFUL");
        assert_eq!(Verdict::Unknown("timeout".into()).to_string(), "VERIFICATION UNKNOWN");
        assert!(Verdict::Safe.is_safe());
        assert!(!Verdict::Unknown(String::new()).is_unsafe());
    }
}
