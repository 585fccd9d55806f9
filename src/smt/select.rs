//! Advisory solver selection
//!
//! A selector only reorders the configured backends. Whatever it answers,
//! every configured backend stays reachable, so a bad ranking costs time
//! and never correctness.

use std::io::{ErrorKind, Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, warn};

use crate::smt::graph::ProgramGraph;
use crate::smt::query::Query;
use crate::smt::smtlib::SmtLibSolver;
use crate::smt::BackendKind;

/// Names the learned selector ranks, in its output order
pub const RANKED_SOLVER_NAMES: [&str; 6] = ["bitwuzla", "boolector", "cvc", "mathsat", "yices", "z3"];

/// Family name a ranking refers to
pub fn family(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Z3 | BackendKind::SmtLib(SmtLibSolver::Z3) => "z3",
        BackendKind::SmtLib(SmtLibSolver::Cvc5) => "cvc",
        BackendKind::SmtLib(SmtLibSolver::Boolector) => "boolector",
        BackendKind::SmtLib(SmtLibSolver::Bitwuzla) => "bitwuzla",
        BackendKind::SmtLib(SmtLibSolver::Yices) => "yices",
        BackendKind::Graph => "sibyl",
    }
}

/// Order `configured` by a list of solver names. Unknown names (and
/// solvers not configured) are ignored; unnamed backends keep their
/// configured order at the end.
pub fn order_by_names<S: AsRef<str>>(names: &[S], configured: &[BackendKind]) -> Vec<BackendKind> {
    let mut out: Vec<BackendKind> = Vec::with_capacity(configured.len());
    for name in names {
        let name = name.as_ref().trim().to_lowercase();
        for kind in configured {
            let matches = family(*kind) == name || kind.to_string() == name;
            if matches && !out.contains(kind) {
                out.push(*kind);
            }
        }
    }
    for kind in configured {
        if !out.contains(kind) {
            out.push(*kind);
        }
    }
    out
}

pub trait SolverSelector: Send {
    fn name(&self) -> &'static str;

    /// Preferred order of `configured` for this query
    fn rank(&mut self, query: &Query, configured: &[BackendKind]) -> Vec<BackendKind>;

    /// Told which backend produced the definitive answer
    fn record_winner(&mut self, _winner: BackendKind) {}
}

/// Configured order, unchanged
#[derive(Debug, Default)]
pub struct FixedOrder;

impl SolverSelector for FixedOrder {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn rank(&mut self, _query: &Query, configured: &[BackendKind]) -> Vec<BackendKind> {
        configured.to_vec()
    }
}

/// Tries the backend that answered last time first
#[derive(Debug, Default)]
pub struct LastWinner {
    last: Option<BackendKind>,
}

impl LastWinner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SolverSelector for LastWinner {
    fn name(&self) -> &'static str {
        "last-winner"
    }

    fn rank(&mut self, _query: &Query, configured: &[BackendKind]) -> Vec<BackendKind> {
        let mut out = configured.to_vec();
        if let Some(pos) = self.last.and_then(|w| out.iter().position(|k| *k == w)) {
            let winner = out.remove(pos);
            out.insert(0, winner);
        }
        out
    }

    fn record_winner(&mut self, winner: BackendKind) {
        self.last = Some(winner);
    }
}

/// Pipes the program graph as JSON to an external command and reads back
/// whitespace- or comma-separated solver names, best first. A command that
/// does not answer within the deadline is killed.
#[derive(Debug, Clone)]
pub struct ExternalSelector {
    command: String,
    timeout: Duration,
}

impl ExternalSelector {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn ask(&self, graph: &ProgramGraph) -> Result<Vec<String>, String> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or("empty selector command")?;
        let json = graph.to_json().map_err(|e| e.to_string())?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to run {}: {}", program, e))?;
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("{} has no stdio pipes", program));
        };

        // Feed and drain on one thread so a command that stops reading
        // cannot block us past the deadline.
        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let res = match stdin.write_all(json.as_bytes()) {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => {
                    drop(stdin);
                    let mut out = String::new();
                    stdout.read_to_string(&mut out).map(|_| out)
                }
            };
            let _ = tx.send(res);
        });

        let out = match rx.recv_timeout(self.timeout) {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.to_string());
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("{} gave no answer within {:?}", program, self.timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err("selector reader exited".into());
            }
        };
        let status = child.wait().map_err(|e| e.to_string())?;
        if !status.success() {
            return Err(format!("{} exited with {}", program, status));
        }
        Ok(out
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl SolverSelector for ExternalSelector {
    fn name(&self) -> &'static str {
        "external"
    }

    fn rank(&mut self, query: &Query, configured: &[BackendKind]) -> Vec<BackendKind> {
        let graph = ProgramGraph::from_query(query);
        match self.ask(&graph) {
            Ok(names) => {
                debug!(ranking = ?names, "external selector answered");
                order_by_names(&names, configured)
            }
            Err(e) => {
                warn!(command = %self.command, error = %e, "solver selection failed, using configured order");
                configured.to_vec()
            }
        }
    }
}

/// How backends are ordered before solving
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    #[default]
    Fixed,
    LastWinner,
    External(String),
}

impl SelectionStrategy {
    pub fn build(&self) -> Box<dyn SolverSelector> {
        match self {
            SelectionStrategy::Fixed => Box::new(FixedOrder),
            SelectionStrategy::LastWinner => Box::new(LastWinner::new()),
            SelectionStrategy::External(cmd) => Box::new(ExternalSelector::new(cmd.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Vec<BackendKind> {
        vec![
            BackendKind::Z3,
            BackendKind::SmtLib(SmtLibSolver::Cvc5),
            BackendKind::SmtLib(SmtLibSolver::Yices),
        ]
    }

    #[test]
    fn test_order_by_names_skips_unknown() {
        let order = order_by_names(&["mathsat", "yices", "cvc", "bitwuzla"], &configured());
        assert_eq!(
            order,
            vec![
                BackendKind::SmtLib(SmtLibSolver::Yices),
                BackendKind::SmtLib(SmtLibSolver::Cvc5),
                BackendKind::Z3,
            ]
        );
    }

    #[test]
    fn test_last_winner_moves_to_front() {
        let mut sel = LastWinner::new();
        let q = Query::new();
        assert_eq!(sel.rank(&q, &configured()), configured());
        sel.record_winner(BackendKind::SmtLib(SmtLibSolver::Yices));
        assert_eq!(
            sel.rank(&q, &configured())[0],
            BackendKind::SmtLib(SmtLibSolver::Yices)
        );
    }

    #[test]
    fn test_external_failure_falls_back() {
        let mut sel = ExternalSelector::new("/nonexistent/selector --model gat.pt");
        assert_eq!(sel.rank(&Query::new(), &configured()), configured());
    }

    #[cfg(unix)]
    #[test]
    fn test_external_ranking_from_command_output() {
        let mut sel = ExternalSelector::new("echo yices, cvc");
        assert_eq!(
            sel.rank(&Query::new(), &configured()),
            vec![
                BackendKind::SmtLib(SmtLibSolver::Yices),
                BackendKind::SmtLib(SmtLibSolver::Cvc5),
                BackendKind::Z3,
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_external_hang_falls_back_after_deadline() {
        let mut sel = ExternalSelector::new("sleep 30").with_timeout(Duration::from_millis(200));
        let start = std::time::Instant::now();
        assert_eq!(sel.rank(&Query::new(), &configured()), configured());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_ranked_names_cover_families() {
        for name in RANKED_SOLVER_NAMES {
            if name == "mathsat" {
                continue;
            }
            let all = [
                BackendKind::Z3,
                BackendKind::SmtLib(SmtLibSolver::Cvc5),
                BackendKind::SmtLib(SmtLibSolver::Boolector),
                BackendKind::SmtLib(SmtLibSolver::Bitwuzla),
                BackendKind::SmtLib(SmtLibSolver::Yices),
            ];
            assert!(all.iter().any(|k| family(*k) == name), "{}", name);
        }
    }
}
