//! Solving one query with several backends
//!
//! Sequential mode walks the ranked backends and stops at the first
//! definitive answer. Parallel mode races them on worker threads: workers
//! pull backends from a shared job queue and report to a coordinator, which
//! keeps the first SAT/UNSAT and raises the stop flag for everyone else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info, warn};

use crate::smt::query::{Query, Witness};
use crate::smt::smtlib::SmtLibProcessBackend;
use crate::smt::{BackendKind, SatResult, SolverBackend, SolverConfig, SolverError};

#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    /// Race backends on worker threads instead of trying them in turn
    pub parallel: bool,
    /// Number of worker threads in parallel mode
    pub num_workers: usize,
    /// Overall budget for one query
    pub timeout: Option<Duration>,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            num_workers: num_cpus::get(),
            timeout: None,
        }
    }
}

impl PortfolioConfig {
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_option(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What one backend said about the query
#[derive(Debug, Clone)]
pub struct Attempt {
    pub backend: BackendKind,
    pub outcome: Result<SatResult, String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct PortfolioResult {
    pub result: SatResult,
    pub witness: Option<Witness>,
    pub winner: Option<BackendKind>,
    pub attempts: Vec<Attempt>,
    pub elapsed: Duration,
}

impl PortfolioResult {
    fn undecided(attempts: Vec<Attempt>, elapsed: Duration) -> Self {
        let reason = if attempts.is_empty() {
            "no backend could decide the query".to_string()
        } else {
            attempts
                .iter()
                .map(|a| match &a.outcome {
                    Ok(r) => format!("{}: {}", a.backend, r),
                    Err(e) => format!("{}: {}", a.backend, e),
                })
                .collect::<Vec<_>>()
                .join("; ")
        };
        Self {
            result: SatResult::Unknown(reason),
            witness: None,
            winner: None,
            attempts,
            elapsed,
        }
    }
}

fn create_backend(
    kind: BackendKind,
    config: &SolverConfig,
    stop: Option<Arc<AtomicBool>>,
) -> Box<dyn SolverBackend> {
    match (kind, stop) {
        (BackendKind::SmtLib(solver), Some(stop)) => {
            Box::new(SmtLibProcessBackend::new(solver, config).with_stop_flag(stop))
        }
        (kind, _) => kind.create(config),
    }
}

/// convert + dec_solve + witness on one backend
fn run_backend(
    backend: &mut dyn SolverBackend,
    query: &Query,
) -> Result<(SatResult, Option<Witness>), SolverError> {
    backend.convert(query)?;
    let result = backend.dec_solve()?;
    let witness = if result == SatResult::Sat {
        backend.witness()?
    } else {
        None
    };
    Ok((result, witness))
}

/// Try backends in order until one answers SAT or UNSAT
pub fn solve_sequential(
    query: &Query,
    order: &[BackendKind],
    config: &SolverConfig,
) -> PortfolioResult {
    let start = Instant::now();
    let mut attempts = Vec::new();
    for &kind in order {
        let begin = Instant::now();
        let mut backend = create_backend(kind, config, None);
        let outcome = run_backend(backend.as_mut(), query);
        let elapsed = begin.elapsed();
        match outcome {
            Ok((result, witness)) if result.is_definitive() => {
                debug!(backend = %kind, result = %result, ?elapsed, "backend answered");
                attempts.push(Attempt {
                    backend: kind,
                    outcome: Ok(result.clone()),
                    elapsed,
                });
                return PortfolioResult {
                    result,
                    witness,
                    winner: Some(kind),
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
            Ok((result, _)) => {
                info!(backend = %kind, result = %result, "backend undecided, trying next");
                attempts.push(Attempt {
                    backend: kind,
                    outcome: Ok(result),
                    elapsed,
                });
            }
            Err(e) => {
                warn!(backend = %kind, error = %e, "backend failed, trying next");
                attempts.push(Attempt {
                    backend: kind,
                    outcome: Err(e.to_string()),
                    elapsed,
                });
            }
        }
    }
    PortfolioResult::undecided(attempts, start.elapsed())
}

enum WorkerMessage {
    Answered {
        worker_id: usize,
        attempt: Attempt,
        witness: Option<Witness>,
    },
    Finished {
        worker_id: usize,
    },
}

fn run_worker(
    worker_id: usize,
    query: Arc<Query>,
    config: SolverConfig,
    jobs: Receiver<BackendKind>,
    to_coordinator: Sender<WorkerMessage>,
    stop: Arc<AtomicBool>,
) {
    while let Ok(kind) = jobs.try_recv() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let begin = Instant::now();
        let mut backend = create_backend(kind, &config, Some(Arc::clone(&stop)));
        let (outcome, witness) = match run_backend(backend.as_mut(), &query) {
            Ok((result, witness)) => (Ok(result), witness),
            Err(e) => (Err(e.to_string()), None),
        };
        let attempt = Attempt {
            backend: kind,
            outcome,
            elapsed: begin.elapsed(),
        };
        if to_coordinator
            .send(WorkerMessage::Answered {
                worker_id,
                attempt,
                witness,
            })
            .is_err()
        {
            return;
        }
    }
    let _ = to_coordinator.send(WorkerMessage::Finished { worker_id });
}

/// Race backends on worker threads; the first definitive answer wins.
///
/// Workers still busy when a winner is found are not joined. External
/// solver processes notice the stop flag and are killed; in-process solvers
/// run to their own timeout in the background.
pub fn solve_portfolio(
    query: &Query,
    order: &[BackendKind],
    config: &SolverConfig,
    portfolio: &PortfolioConfig,
) -> PortfolioResult {
    let start = Instant::now();
    let kinds: Vec<BackendKind> = order.iter().copied().filter(|k| k.decides()).collect();
    if kinds.is_empty() {
        return PortfolioResult::undecided(Vec::new(), start.elapsed());
    }
    let num_workers = portfolio.num_workers.clamp(1, kinds.len());

    let (job_tx, job_rx) = unbounded();
    for kind in &kinds {
        let _ = job_tx.send(*kind);
    }
    drop(job_tx);

    let (worker_tx, coordinator_rx) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let query = Arc::new(query.clone());
    for worker_id in 0..num_workers {
        let query = Arc::clone(&query);
        let config = config.clone();
        let jobs = job_rx.clone();
        let tx = worker_tx.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || run_worker(worker_id, query, config, jobs, tx, stop));
    }
    drop(worker_tx);
    info!(workers = num_workers, backends = kinds.len(), "portfolio started");

    let deadline = portfolio.timeout.map(|t| start + t);
    let mut attempts = Vec::new();
    let mut finished = 0;
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!("portfolio deadline reached");
            stop.store(true, Ordering::SeqCst);
            break;
        }
        match coordinator_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(WorkerMessage::Answered {
                worker_id,
                attempt,
                witness,
            }) => {
                debug!(worker_id, backend = %attempt.backend, outcome = ?attempt.outcome, "worker reported");
                let answer = match &attempt.outcome {
                    Ok(r) if r.is_definitive() => Some(r.clone()),
                    _ => None,
                };
                if let Some(result) = answer {
                    stop.store(true, Ordering::SeqCst);
                    let winner = attempt.backend;
                    attempts.push(attempt);
                    return PortfolioResult {
                        result,
                        witness,
                        winner: Some(winner),
                        attempts,
                        elapsed: start.elapsed(),
                    };
                }
                attempts.push(attempt);
            }
            Ok(WorkerMessage::Finished { worker_id }) => {
                debug!(worker_id, "worker out of backends");
                finished += 1;
                if finished >= num_workers {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    PortfolioResult::undecided(attempts, start.elapsed())
}

/// Dispatch on `portfolio.parallel`
pub fn solve(
    query: &Query,
    order: &[BackendKind],
    config: &SolverConfig,
    portfolio: &PortfolioConfig,
) -> PortfolioResult {
    if portfolio.parallel && order.len() > 1 {
        solve_portfolio(query, order, config, portfolio)
    } else {
        solve_sequential(query, order, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::smtlib::SmtLibSolver;
    use crate::smt::sort::Sort;
    use crate::smt::term::{BvBinaryOp, Term};

    fn failing_query() -> Query {
        // x = 3 (or x = 0x53) violates the claim
        let x = Term::symbol("x", Sort::BitVec(8));
        let mut q = Query::new();
        q.add_claim(
            0,
            "x * 3 != 9",
            Term::tt(),
            Term::not(Term::eq(
                Term::bv_binary(BvBinaryOp::Mul, x, Term::bv(3, 8)),
                Term::bv(9, 8),
            )),
            Term::tt(),
        );
        q
    }

    #[test]
    fn test_sequential_skips_undecided_backends() {
        let order = [BackendKind::Graph, BackendKind::Z3];
        let res = solve_sequential(&failing_query(), &order, &SolverConfig::default());
        assert_eq!(res.result, SatResult::Sat);
        assert_eq!(res.winner, Some(BackendKind::Z3));
        assert_eq!(res.attempts.len(), 2);
        let w = res.witness.unwrap();
        assert!(failing_query().holds_under(&w));
    }

    #[test]
    fn test_sequential_all_undecided_is_unknown() {
        let res = solve_sequential(&failing_query(), &[BackendKind::Graph], &SolverConfig::default());
        assert!(matches!(res.result, SatResult::Unknown(_)));
        assert!(res.winner.is_none());
    }

    #[test]
    fn test_portfolio_survives_missing_solver_binary() {
        // a missing external solver fails; z3 in-process still answers
        let order = [
            BackendKind::SmtLib(SmtLibSolver::Bitwuzla),
            BackendKind::Z3,
        ];
        let cfg = PortfolioConfig::default()
            .with_parallel(true)
            .with_workers(2)
            .with_timeout(Duration::from_secs(60));
        let res = solve(&failing_query(), &order, &SolverConfig::default(), &cfg);
        assert_eq!(res.result, SatResult::Sat);
        assert!(res.witness.is_some());
    }

    #[test]
    fn test_portfolio_config_builder() {
        let cfg = PortfolioConfig::default().with_workers(0).with_parallel(true);
        assert_eq!(cfg.num_workers, 1);
        assert!(cfg.parallel);
        assert!(cfg.timeout.is_none());
    }
}
