//! SMT-LIB2 printing and external solver processes

use std::fmt;
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, warn};

use crate::smt::query::{Query, Witness};
use crate::smt::sort::{Sort, Value};
use crate::smt::term::quote_symbol;
use crate::smt::{SatResult, SolverBackend, SolverConfig, SolverError};

/// Render a query as a self-contained SMT-LIB2 script (without `check-sat`)
pub fn to_smtlib(query: &Query) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "(set-option :produce-models true)");
    let _ = writeln!(out, "(set-logic QF_BV)");
    for (name, sort) in &query.declarations {
        let _ = writeln!(out, "(declare-fun {} () {})", quote_symbol(name), sort);
    }
    for assertion in &query.assertions {
        let _ = writeln!(out, "(assert {})", assertion);
    }
    for claim in &query.claims {
        let _ = writeln!(out, "; claim {}: {}", claim.step, claim.comment);
    }
    let _ = writeln!(out, "(assert {})", query.goal());
    out
}

/// External solvers that speak SMT-LIB2 on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtLibSolver {
    Z3,
    Cvc5,
    Boolector,
    Bitwuzla,
    Yices,
}

impl SmtLibSolver {
    pub const ALL: [SmtLibSolver; 5] = [
        SmtLibSolver::Z3,
        SmtLibSolver::Cvc5,
        SmtLibSolver::Boolector,
        SmtLibSolver::Bitwuzla,
        SmtLibSolver::Yices,
    ];

    /// Executable and arguments reading a script from stdin
    pub fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            SmtLibSolver::Z3 => ("z3", &["-in", "-smt2"]),
            SmtLibSolver::Cvc5 => ("cvc5", &["--lang", "smt2"]),
            SmtLibSolver::Boolector => ("boolector", &["--smt2", "--model-gen"]),
            SmtLibSolver::Bitwuzla => ("bitwuzla", &["--lang", "smt2"]),
            SmtLibSolver::Yices => ("yices-smt2", &[]),
        }
    }
}

impl fmt::Display for SmtLibSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtLibSolver::Z3 => write!(f, "z3"),
            SmtLibSolver::Cvc5 => write!(f, "cvc5"),
            SmtLibSolver::Boolector => write!(f, "boolector"),
            SmtLibSolver::Bitwuzla => write!(f, "bitwuzla"),
            SmtLibSolver::Yices => write!(f, "yices"),
        }
    }
}

impl FromStr for SmtLibSolver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "z3" => Ok(SmtLibSolver::Z3),
            "cvc" | "cvc5" => Ok(SmtLibSolver::Cvc5),
            "boolector" => Ok(SmtLibSolver::Boolector),
            "bitwuzla" => Ok(SmtLibSolver::Bitwuzla),
            "yices" | "yices2" => Ok(SmtLibSolver::Yices),
            _ => Err(format!("unknown SMT-LIB solver: {}", s)),
        }
    }
}

/// Minimal S-expression, enough for solver responses
#[derive(Debug, Clone, PartialEq)]
enum SExpr {
    Atom(String),
    List(Vec<SExpr>),
}

fn tokenize(input: &str) -> Result<Vec<String>, SolverError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '(' | ')' => {
                tokens.push(c.to_string());
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            ';' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '|' => {
                chars.next();
                let mut atom = String::new();
                loop {
                    match chars.next() {
                        Some('|') => break,
                        Some(c) => atom.push(c),
                        None => {
                            return Err(SolverError::MalformedOutput(
                                "unterminated quoted symbol".into(),
                            ))
                        }
                    }
                }
                tokens.push(atom);
            }
            '"' => {
                chars.next();
                let mut atom = String::from("\"");
                for c in chars.by_ref() {
                    atom.push(c);
                    if c == '"' {
                        break;
                    }
                }
                tokens.push(atom);
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '(' || c == ')' || c.is_whitespace() {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(atom);
            }
        }
    }
    Ok(tokens)
}

fn parse_sexprs(input: &str) -> Result<Vec<SExpr>, SolverError> {
    let tokens = tokenize(input)?;
    let mut stack: Vec<Vec<SExpr>> = vec![Vec::new()];
    for tok in tokens {
        match tok.as_str() {
            "(" => stack.push(Vec::new()),
            ")" => {
                let done = stack
                    .pop()
                    .ok_or_else(|| SolverError::MalformedOutput("unbalanced ')'".into()))?;
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| SolverError::MalformedOutput("unbalanced ')'".into()))?;
                parent.push(SExpr::List(done));
            }
            _ => {
                if let Some(top) = stack.last_mut() {
                    top.push(SExpr::Atom(tok));
                }
            }
        }
    }
    if stack.len() != 1 {
        return Err(SolverError::MalformedOutput("unbalanced '('".into()));
    }
    Ok(stack.pop().unwrap_or_default())
}

fn parse_value(expr: &SExpr, sort: Sort) -> Option<Value> {
    match (expr, sort) {
        (SExpr::Atom(a), Sort::Bool) => match a.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (SExpr::Atom(a), Sort::BitVec(w)) => {
            if let Some(bits) = a.strip_prefix("#b") {
                u64::from_str_radix(bits, 2).ok().map(|v| Value::bv(v, w))
            } else if let Some(hex) = a.strip_prefix("#x") {
                u64::from_str_radix(hex, 16).ok().map(|v| Value::bv(v, w))
            } else {
                None
            }
        }
        (SExpr::List(items), Sort::BitVec(w)) => match items.as_slice() {
            [SExpr::Atom(us), SExpr::Atom(bv), SExpr::Atom(_)] if us == "_" => bv
                .strip_prefix("bv")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| Value::bv(v, w)),
            _ => None,
        },
        _ => None,
    }
}

/// Solver answer plus the `get-value` pairs that followed it
fn parse_response(
    output: &str,
    declarations: &[(String, Sort)],
) -> Result<(SatResult, Option<Witness>), SolverError> {
    let exprs = parse_sexprs(output)?;
    let mut iter = exprs.iter();
    let status = match iter.next() {
        Some(SExpr::Atom(a)) if a == "sat" => SatResult::Sat,
        Some(SExpr::Atom(a)) if a == "unsat" => return Ok((SatResult::Unsat, None)),
        Some(SExpr::Atom(a)) if a == "unknown" => {
            return Ok((SatResult::Unknown("solver returned unknown".into()), None))
        }
        Some(SExpr::List(items)) if matches!(items.first(), Some(SExpr::Atom(e)) if e == "error") => {
            let message = items
                .get(1)
                .map(|m| match m {
                    SExpr::Atom(a) => a.trim_matches('"').to_string(),
                    SExpr::List(_) => "error".to_string(),
                })
                .unwrap_or_default();
            return Err(SolverError::Backend {
                solver: "smt-lib".into(),
                message,
            });
        }
        other => {
            return Err(SolverError::MalformedOutput(format!(
                "expected sat/unsat/unknown, got {:?}",
                other
            )))
        }
    };

    let mut witness = Witness::new();
    for expr in iter {
        let SExpr::List(pairs) = expr else { continue };
        for pair in pairs {
            let SExpr::List(kv) = pair else { continue };
            let [SExpr::Atom(name), value] = kv.as_slice() else {
                continue;
            };
            let Some((_, sort)) = declarations.iter().find(|(n, _)| n == name) else {
                continue;
            };
            let value = parse_value(value, *sort).ok_or_else(|| {
                SolverError::MalformedOutput(format!("cannot read value of {}", name))
            })?;
            witness.insert(name.clone(), value);
        }
    }
    Ok((status, Some(witness)))
}

/// Runs an external SMT-LIB2 solver, one process per `dec_solve`
pub struct SmtLibProcessBackend {
    solver: SmtLibSolver,
    config: SolverConfig,
    stop: Option<Arc<AtomicBool>>,
    script: Option<String>,
    declarations: Vec<(String, Sort)>,
    witness: Option<Witness>,
}

/// Write `input` to the child's stdin and close it. On failure the child is
/// killed and reaped before the error is returned.
fn feed_stdin(child: &mut Child, input: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = child.stdin.take() else {
        return Ok(());
    };
    if let Err(e) = stdin.write_all(input) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }
    Ok(())
}

impl SmtLibProcessBackend {
    pub fn new(solver: SmtLibSolver, config: &SolverConfig) -> Self {
        Self {
            solver,
            config: config.clone(),
            stop: None,
            script: None,
            declarations: Vec::new(),
            witness: None,
        }
    }

    /// Kill the process early once `stop` is raised
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn run(&self, script: &str) -> Result<Option<String>, SolverError> {
        let (program, args) = self.solver.command();
        let spawn_err = |source| SolverError::Spawn {
            solver: self.solver.to_string(),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(spawn_err)?;

        feed_stdin(&mut child, script.as_bytes()).map_err(spawn_err)?;

        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SolverError::Backend {
                solver: self.solver.to_string(),
                message: "no stdout".into(),
            });
        };
        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let mut buf = String::new();
            let res = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = tx.send(res);
        });

        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d)
                || self.stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst))
            {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(res) => {
                    let _ = child.wait();
                    return res.map(Some).map_err(spawn_err);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SolverError::Backend {
                        solver: self.solver.to_string(),
                        message: "output reader exited".into(),
                    });
                }
            }
        }
    }
}

impl SolverBackend for SmtLibProcessBackend {
    fn name(&self) -> String {
        self.solver.to_string()
    }

    fn convert(&mut self, query: &Query) -> Result<(), SolverError> {
        let mut script = to_smtlib(query);
        script.push_str("(check-sat)\n");
        self.declarations = query
            .declarations
            .iter()
            .map(|(n, s)| (n.clone(), *s))
            .collect();
        if !self.declarations.is_empty() {
            let names: Vec<String> = self
                .declarations
                .iter()
                .map(|(n, _)| quote_symbol(n).into_owned())
                .collect();
            let _ = writeln!(script, "(get-value ({}))", names.join(" "));
        }
        script.push_str("(exit)\n");
        self.script = Some(script);
        self.witness = None;
        Ok(())
    }

    fn dec_solve(&mut self) -> Result<SatResult, SolverError> {
        let script = self.script.as_deref().ok_or(SolverError::NotConverted)?;
        debug!(solver = %self.solver, bytes = script.len(), "running external solver");
        let Some(output) = self.run(script)? else {
            warn!(solver = %self.solver, "solver process stopped before answering");
            return Ok(SatResult::Unknown("timeout".into()));
        };
        let (result, witness) = parse_response(&output, &self.declarations).map_err(|e| match e {
            SolverError::Backend { message, .. } => SolverError::Backend {
                solver: self.solver.to_string(),
                message,
            },
            other => other,
        })?;
        self.witness = witness;
        Ok(result)
    }

    fn witness(&mut self) -> Result<Option<Witness>, SolverError> {
        Ok(self.witness.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::term::{BvBinaryOp, Term};

    #[cfg(unix)]
    #[test]
    fn test_failed_write_kills_and_reaps_child() {
        // closes its stdin, then idles
        let mut child = Command::new("sh")
            .args(["-c", "exec 0<&-; sleep 30"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let input = vec![b'('; 1 << 20];
        assert!(feed_stdin(&mut child, &input).is_err());
        let status = child.try_wait().unwrap().expect("child was reaped");
        assert!(!status.success());
    }

    #[test]
    fn test_script_declares_and_asserts() {
        let x = Term::symbol("x#1", Sort::BitVec(8));
        let mut q = Query::new();
        q.assert(Term::eq(
            x.clone(),
            Term::bv_binary(BvBinaryOp::Add, Term::symbol("n", Sort::BitVec(8)), Term::bv(1, 8)),
        ));
        q.add_claim(
            3,
            "assertion",
            Term::tt(),
            Term::not(Term::eq(x, Term::bv(0, 8))),
            Term::tt(),
        );
        let script = to_smtlib(&q);
        assert!(script.contains("(declare-fun |x#1| () (_ BitVec 8))"));
        assert!(script.contains("(declare-fun n () (_ BitVec 8))"));
        assert!(script.contains("(assert (= |x#1| (bvadd n (_ bv1 8))))"));
        assert!(script.contains("; claim 3: assertion"));
        assert!(script.trim_end().ends_with("(assert (not (not (= |x#1| (_ bv0 8)))))"));
    }

    #[test]
    fn test_parse_sat_with_values() {
        let decls = vec![
            ("x#1".to_string(), Sort::BitVec(8)),
            ("y".to_string(), Sort::BitVec(16)),
            ("z".to_string(), Sort::BitVec(4)),
            ("flag".to_string(), Sort::Bool),
        ];
        let out = "sat\n((|x#1| #b00000101)\n (y #x00ff) (z (_ bv9 4)) (flag true))\n";
        let (res, witness) = parse_response(out, &decls).unwrap();
        assert_eq!(res, SatResult::Sat);
        let w = witness.unwrap();
        assert_eq!(w.get("x#1"), Some(Value::bv(5, 8)));
        assert_eq!(w.get("y"), Some(Value::bv(255, 16)));
        assert_eq!(w.get("z"), Some(Value::bv(9, 4)));
        assert_eq!(w.get("flag"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_parse_unsat_ignores_trailing_errors() {
        let out = "unsat\n(error \"line 9: model is not available\")\n";
        let (res, witness) = parse_response(out, &[]).unwrap();
        assert_eq!(res, SatResult::Unsat);
        assert!(witness.is_none());
    }

    #[test]
    fn test_parse_error_and_garbage() {
        assert!(matches!(
            parse_response("(error \"bad logic\")", &[]),
            Err(SolverError::Backend { .. })
        ));
        assert!(matches!(
            parse_response("segfault", &[]),
            Err(SolverError::MalformedOutput(_))
        ));
        assert!(parse_sexprs("((a b)").is_err());
    }

    #[test]
    fn test_solver_names() {
        for s in SmtLibSolver::ALL {
            assert_eq!(s.to_string().parse::<SmtLibSolver>().unwrap(), s);
        }
        assert_eq!("cvc".parse::<SmtLibSolver>().unwrap(), SmtLibSolver::Cvc5);
        assert!("mathsat".parse::<SmtLibSolver>().is_err());
    }

    #[test]
    fn test_solve_before_convert_fails() {
        let mut backend = SmtLibProcessBackend::new(SmtLibSolver::Bitwuzla, &SolverConfig::default());
        assert!(matches!(backend.dec_solve(), Err(SolverError::NotConverted)));
    }
}
