use reachtree::bmc::Counterexample;
use reachtree::ir::Endianness;
use reachtree::smt::{SatResult, SolverBackend, SolverConfig, Z3Backend};
use reachtree::symex::{
    ExploreConfig, ExplorePhase, InterleavingPolicy, ReachabilityTree, StepKind, SymexError, SymexResult,
};

use crate::{load_demo, program};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const HANDOFF: &str = "\
.global x i32 0
.global y i32 0
.function producer
    assign x 1
    assign y 1
.end
.function main
.local p thread
    create producer -> p
    join p
    assert (== (+ x y) 2) \"both writes visible after join\"
.end
";

fn all_formulas(tree: &mut ReachabilityTree<'_>) -> Result<Vec<SymexResult>, SymexError> {
    let mut out = Vec::new();
    tree.setup_for_new_explore()?;
    loop {
        out.push(tree.get_next_formula()?);
        if !tree.setup_next_formula()? {
            return Ok(out);
        }
    }
}

/// Drive the first interleaving by hand instead of through
/// `get_next_formula`
fn first_formula_by_hand(tree: &mut ReachabilityTree<'_>) -> Result<SymexResult, SymexError> {
    tree.setup_for_new_explore()?;
    while !tree.is_has_complete_formula() {
        let outcome = tree.step_current()?;
        if tree.is_has_complete_formula() {
            break;
        }
        if outcome.is_switch_point() && !tree.switch_to_next_execution_state()? {
            break;
        }
    }
    tree.finish_formula()
}

#[test]
fn test_big_endian_race_is_satisfiable() -> TestResult {
    let program = load_demo("big_endian_race.gp");
    let config = ExploreConfig::default().with_endianness(Endianness::Big);
    let mut tree = ReachabilityTree::new(&program, config);

    let mut found = false;
    for result in all_formulas(&mut tree)? {
        let mut backend = Z3Backend::new(&SolverConfig::default());
        let query = result.equation.convert(&mut backend)?;
        if backend.dec_solve()? == SatResult::Sat {
            let witness = backend.witness()?.ok_or("SAT without a witness")?;
            let cex = Counterexample::build(&result.equation, &query, &witness, &result.schedule)
                .ok_or("witness violates no claim")?;
            assert_eq!(cex.violation.comment, "reader observed the high byte");
            assert!(!cex.schedule.is_empty());
            found = true;
        }
    }
    assert!(found, "some interleaving must expose the race");
    Ok(())
}

#[test]
fn test_little_endian_reader_never_sees_one() -> TestResult {
    let program = load_demo("big_endian_race.gp");
    let config = ExploreConfig::default().with_endianness(Endianness::Little);
    let mut tree = ReachabilityTree::new(&program, config);
    for result in all_formulas(&mut tree)? {
        let mut backend = Z3Backend::new(&SolverConfig::default());
        result.equation.convert(&mut backend)?;
        assert_eq!(backend.dec_solve()?, SatResult::Unsat);
    }
    Ok(())
}

#[test]
fn test_manual_stepping_matches_driver() -> TestResult {
    let program = program(HANDOFF);
    let mut driven = ReachabilityTree::new(&program, ExploreConfig::default());
    driven.setup_for_new_explore()?;
    let expected = driven.get_next_formula()?;

    let mut manual = ReachabilityTree::new(&program, ExploreConfig::default());
    let actual = first_formula_by_hand(&mut manual)?;
    assert_eq!(actual.equation, expected.equation);
    assert_eq!(actual.schedule, expected.schedule);
    assert_eq!(manual.phase(), ExplorePhase::Finalized);
    Ok(())
}

#[test]
fn test_exploration_is_deterministic() -> TestResult {
    let program = load_demo("lost_update.gp");
    for policy in [
        InterleavingPolicy::RoundRobin,
        InterleavingPolicy::Sequential,
        InterleavingPolicy::Random { seed: 7 },
    ] {
        let config = ExploreConfig::default().with_policy(policy);
        let first = all_formulas(&mut ReachabilityTree::new(&program, config.clone()))?;
        let second = all_formulas(&mut ReachabilityTree::new(&program, config))?;
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.equation, b.equation);
            assert_eq!(a.schedule, b.schedule);
        }
    }
    Ok(())
}

#[test]
fn test_setup_restarts_exploration() -> TestResult {
    let program = load_demo("lost_update.gp");
    let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
    let first = all_formulas(&mut tree)?;
    let again = all_formulas(&mut tree)?;
    assert_eq!(first.len(), again.len());
    assert_eq!(tree.formulas(), again.len());
    Ok(())
}

#[test]
fn test_join_orders_the_handoff() -> TestResult {
    let program = program(HANDOFF);
    let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
    for result in all_formulas(&mut tree)? {
        let mut backend = Z3Backend::with_default_config();
        result.equation.convert(&mut backend)?;
        assert_eq!(backend.dec_solve()?, SatResult::Unsat);
    }
    Ok(())
}

#[test]
fn test_finished_formula_is_immutable() -> TestResult {
    let program = program(HANDOFF);
    let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
    tree.setup_for_new_explore()?;
    let result = tree.get_next_formula()?;
    assert!(tree.equation().is_closed());
    assert!(tree.step_current().is_err());
    assert!(tree.finish_formula().is_err());
    assert_eq!(tree.equation().len(), result.equation.len());
    Ok(())
}

#[test]
fn test_every_thread_contributes() -> TestResult {
    let program = program(HANDOFF);
    let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
    tree.setup_for_new_explore()?;
    let result = tree.get_next_formula()?;
    let threads: Vec<usize> = result.equation.steps().iter().map(|s| s.source.thread).collect();
    assert!(threads.contains(&0));
    assert!(threads.contains(&1));
    assert_eq!(result.statistics.threads, 2);
    Ok(())
}

#[test]
fn test_unwind_bound_cuts_loop() -> TestResult {
    let program = load_demo("loop.gp");
    let config = ExploreConfig::default()
        .with_unwind(2)
        .with_unwinding_assertions(true);
    let mut tree = ReachabilityTree::new(&program, config);
    tree.setup_for_new_explore()?;
    let result = tree.get_next_formula()?;
    let comments: Vec<&str> = result
        .equation
        .steps()
        .iter()
        .filter_map(|s| match &s.kind {
            StepKind::Assert { comment, .. } => Some(comment.as_str()),
            _ => None,
        })
        .collect();
    assert!(comments.contains(&"unwinding assertion"));
    Ok(())
}

#[test]
fn test_join_on_symbolic_handle_is_unsupported() {
    let program = program(
        "\
.function worker
    skip
.end
.function main
.local a thread
.local h thread
    create worker -> a
    join h
.end
",
    );
    let mut tree = ReachabilityTree::new(&program, ExploreConfig::default());
    let result = tree
        .setup_for_new_explore()
        .and_then(|_| tree.get_next_formula());
    assert!(matches!(result, Err(SymexError::Unsupported { .. })));
}
