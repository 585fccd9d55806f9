//! Solver adapter layer
//!
//! A closed equation is encoded once into a [`Query`], a solver-independent
//! list of terms. Each backend implements [`SolverBackend`]: `convert` turns
//! the query into its native representation, `dec_solve` decides it, and
//! `witness` retrieves the model after a SAT answer. The engine only talks
//! to this trait.

pub mod graph;
pub mod portfolio;
pub mod query;
pub mod select;
pub mod smtlib;
pub mod sort;
pub mod term;
pub mod z3_backend;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub use graph::{GraphBackend, ProgramGraph};
pub use query::{Claim, Query, Witness};
pub use smtlib::{SmtLibProcessBackend, SmtLibSolver};
pub use sort::{Sort, Value};
pub use term::{BvBinaryOp, BvCompareOp, BvUnaryOp, Term, TermKind};
pub use z3_backend::Z3Backend;

/// Outcome of a decision procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    /// Timeout, resource limit, or a backend that cannot decide
    Unknown(String),
}

impl SatResult {
    /// SAT and UNSAT are definitive; UNKNOWN may be retried elsewhere
    pub fn is_definitive(&self) -> bool {
        !matches!(self, SatResult::Unknown(_))
    }
}

impl fmt::Display for SatResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SatResult::Sat => write!(f, "SAT"),
            SatResult::Unsat => write!(f, "UNSAT"),
            SatResult::Unknown(reason) => write!(f, "UNKNOWN ({})", reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no query has been converted")]
    NotConverted,
    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },
    #[error("failed to run {solver}: {source}")]
    Spawn {
        solver: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{solver} reported an error: {message}")]
    Backend { solver: String, message: String },
    #[error("malformed solver output: {0}")]
    MalformedOutput(String),
    #[error("ill-sorted term: {0}")]
    IllSorted(String),
}

/// Configuration for the SMT solver
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Timeout for SMT solving (None means no timeout)
    pub timeout: Option<Duration>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl SolverConfig {
    /// Create a config with no timeout
    pub fn no_timeout() -> Self {
        Self { timeout: None }
    }

    /// Create a config with a specific timeout in seconds
    pub fn with_timeout_secs(secs: u64) -> Self {
        Self {
            timeout: Some(Duration::from_secs(secs)),
        }
    }

    /// Create a config with a specific timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Capability interface every solver backend offers
pub trait SolverBackend {
    /// Name used in reports and by solver selection
    fn name(&self) -> String;

    /// Translate `query` into the backend's native representation,
    /// replacing anything converted before.
    fn convert(&mut self, query: &Query) -> Result<(), SolverError>;

    /// Decide the converted query
    fn dec_solve(&mut self) -> Result<SatResult, SolverError>;

    /// Values for every declared symbol, available after a SAT answer
    fn witness(&mut self) -> Result<Option<Witness>, SolverError>;
}

/// The interchangeable backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process Z3 through the `z3` crate
    Z3,
    /// External solver driven over SMT-LIB2
    SmtLib(SmtLibSolver),
    /// Graph encoder for learned solver selection; never decides
    Graph,
}

impl BackendKind {
    /// Default order tried when nothing else is configured
    pub const DEFAULT_ORDER: [BackendKind; 1] = [BackendKind::Z3];

    pub fn create(&self, config: &SolverConfig) -> Box<dyn SolverBackend> {
        match self {
            BackendKind::Z3 => Box::new(Z3Backend::new(config)),
            BackendKind::SmtLib(solver) => Box::new(SmtLibProcessBackend::new(*solver, config)),
            BackendKind::Graph => Box::new(GraphBackend::new()),
        }
    }

    /// Whether the backend can answer SAT/UNSAT at all
    pub fn decides(&self) -> bool {
        !matches!(self, BackendKind::Graph)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Z3 => write!(f, "z3"),
            BackendKind::SmtLib(SmtLibSolver::Z3) => write!(f, "z3-smt2"),
            BackendKind::SmtLib(solver) => write!(f, "{}", solver),
            BackendKind::Graph => write!(f, "sibyl"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "z3" => Ok(BackendKind::Z3),
            "z3-smt2" => Ok(BackendKind::SmtLib(SmtLibSolver::Z3)),
            "sibyl" | "graph" => Ok(BackendKind::Graph),
            other => other
                .parse::<SmtLibSolver>()
                .map(BackendKind::SmtLib)
                .map_err(|_| format!("unknown solver backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names_roundtrip() {
        for name in ["z3", "z3-smt2", "cvc5", "boolector", "bitwuzla", "yices", "sibyl"] {
            let kind: BackendKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert_eq!(
            "cvc".parse::<BackendKind>().unwrap(),
            BackendKind::SmtLib(SmtLibSolver::Cvc5)
        );
        assert!("mathsat".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_sat_result() {
        assert!(SatResult::Sat.is_definitive());
        assert!(!SatResult::Unknown("timeout".into()).is_definitive());
        assert_eq!(SatResult::Unsat.to_string(), "UNSAT");
    }

    #[test]
    fn test_solver_config() {
        assert_eq!(
            SolverConfig::default().timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(SolverConfig::no_timeout().timeout, None);
        assert_eq!(
            SolverConfig::with_timeout_secs(2).timeout,
            Some(Duration::from_secs(2))
        );
    }
}
