use reachtree::bmc::{Bmc, BmcConfig, Verdict};
use reachtree::ir::{Endianness, GotoProgram};
use reachtree::smt::BackendKind;
use reachtree::symex::{CancellationToken, ExploreConfig, SymexError};

use crate::{load_demo, program};

fn verify(program: &GotoProgram, explore: ExploreConfig) -> Verdict {
    let config = BmcConfig::default().with_explore(explore);
    Bmc::new(program, config)
        .run()
        .expect("verification should not fail")
        .verdict
}

fn violated(verdict: &Verdict) -> &str {
    match verdict {
        Verdict::Unsafe(cex) => cex.violation.comment.as_str(),
        other => panic!("expected a counterexample, got {}", other),
    }
}

#[test]
fn test_lost_update_is_found() {
    let verdict = verify(&load_demo("lost_update.gp"), ExploreConfig::default());
    assert_eq!(violated(&verdict), "both increments visible");
}

#[test]
fn test_mutex_prevents_lost_update() {
    let verdict = verify(&load_demo("locked_counter.gp"), ExploreConfig::default());
    assert_eq!(verdict, Verdict::Safe);
}

#[test]
fn test_counterexample_lists_both_threads() {
    let verdict = verify(&load_demo("lost_update.gp"), ExploreConfig::default());
    let Verdict::Unsafe(cex) = verdict else {
        panic!("expected a counterexample");
    };
    let threads = cex.threads();
    assert!(threads.contains(&1));
    assert!(threads.contains(&2));
    let text = cex.to_string();
    assert!(text.starts_with("Counterexample:"));
    assert!(text.contains("Violated property: both increments visible"));
}

#[test]
fn test_byte_order_follows_target() {
    let program = load_demo("byte_order.gp");
    let little = verify(&program, ExploreConfig::default().with_endianness(Endianness::Little));
    assert_eq!(little, Verdict::Safe);
    let big = verify(&program, ExploreConfig::default().with_endianness(Endianness::Big));
    assert_eq!(violated(&big), "low byte first");
}

#[test]
fn test_big_endian_race_fails() {
    let program = load_demo("big_endian_race.gp");
    let verdict = verify(&program, ExploreConfig::default().with_endianness(Endianness::Big));
    assert_eq!(violated(&verdict), "reader observed the high byte");
}

#[test]
fn test_loop_within_bound_is_safe() {
    let verdict = verify(&load_demo("loop.gp"), ExploreConfig::default().with_unwind(4));
    assert_eq!(verdict, Verdict::Safe);
}

#[test]
fn test_cut_loop_is_assumed_away_by_default() {
    let verdict = verify(&load_demo("loop.gp"), ExploreConfig::default().with_unwind(2));
    assert_eq!(verdict, Verdict::Safe);
}

#[test]
fn test_unwinding_assertion_reports_cut_loop() {
    let explore = ExploreConfig::default()
        .with_unwind(2)
        .with_unwinding_assertions(true);
    let verdict = verify(&load_demo("loop.gp"), explore);
    assert_eq!(violated(&verdict), "unwinding assertion");
}

#[test]
fn test_deadlock_needs_the_check() {
    let program = load_demo("deadlock.gp");
    assert_eq!(verify(&program, ExploreConfig::default()), Verdict::Safe);
    let verdict = verify(&program, ExploreConfig::default().with_deadlock_check(true));
    assert_eq!(violated(&verdict), "deadlock detected");
}

const DIVIDE: &str = "\
.function main
.local d i32
.local r i32
    assign r (/ 100 d)
.end
";

#[test]
fn test_division_by_zero() {
    let program = program(DIVIDE);
    let verdict = verify(&program, ExploreConfig::default());
    assert_eq!(violated(&verdict), "division by zero");
    let unchecked = verify(&program, ExploreConfig::default().with_div_by_zero_check(false));
    assert_eq!(unchecked, Verdict::Safe);
}

#[test]
fn test_signed_overflow() {
    let program = program(
        "\
.function main
.local x i8
.local y i8
    assign y (+ x 1)
.end
",
    );
    assert_eq!(verify(&program, ExploreConfig::default()), Verdict::Safe);
    let verdict = verify(&program, ExploreConfig::default().with_overflow_check(true));
    assert_eq!(violated(&verdict), "arithmetic overflow on +");
}

#[test]
fn test_signed_overflow_at_64_bits() {
    let constant = program(
        "\
.function main
.local x i64
    assign x (* 4611686018427387904 4)
.end
",
    );
    let verdict = verify(&constant, ExploreConfig::default().with_overflow_check(true));
    assert_eq!(violated(&verdict), "arithmetic overflow on *");

    let symbolic = program(
        "\
.function main
.local x i64
.local y i64
    assign y (+ x 1)
.end
",
    );
    let verdict = verify(&symbolic, ExploreConfig::default().with_overflow_check(true));
    assert_eq!(violated(&verdict), "arithmetic overflow on +");
}

#[test]
fn test_signed_overflow_on_odd_width_multiply() {
    let overflowing = program(
        "\
.function main
.local x i40
.local y i40
    assign y (* x 3)
.end
",
    );
    let verdict = verify(&overflowing, ExploreConfig::default().with_overflow_check(true));
    assert_eq!(violated(&verdict), "arithmetic overflow on *");

    let bounded = program(
        "\
.function main
.local x i40
.local y i40
    assume (== x 5)
    assign y (* x 3)
.end
",
    );
    let verdict = verify(&bounded, ExploreConfig::default().with_overflow_check(true));
    assert_eq!(verdict, Verdict::Safe);
}

#[test]
fn test_data_race_on_shared_write() {
    let program = program(
        "\
.global x i32 0
.function writer v:i32
    assign x v
.end
.function main
.local a thread
.local b thread
    create writer 1 -> a
    create writer 2 -> b
    join a
    join b
.end
",
    );
    assert_eq!(verify(&program, ExploreConfig::default()), Verdict::Safe);
    let verdict = verify(&program, ExploreConfig::default().with_data_races_check(true));
    assert!(violated(&verdict).starts_with("data race on"));
}

#[test]
fn test_all_runs_keeps_exploring() {
    let program = load_demo("lost_update.gp");
    let config = BmcConfig::default().with_all_runs(true);
    let outcome = Bmc::new(&program, config).run().expect("verification should not fail");
    assert!(outcome.verdict.is_unsafe());
    assert!(outcome.statistics.failed >= 1);
    assert!(outcome.statistics.interleavings > outcome.statistics.failed);
}

#[test]
fn test_first_failure_stops_exploration() {
    let program = load_demo("lost_update.gp");
    let outcome = Bmc::new(&program, BmcConfig::default())
        .run()
        .expect("verification should not fail");
    assert_eq!(outcome.statistics.failed, 1);
}

#[test]
fn test_interleaving_limit_leaves_verdict_open() {
    let program = load_demo("locked_counter.gp");
    let config = BmcConfig::default().with_max_interleavings(Some(1));
    let outcome = Bmc::new(&program, config).run().expect("verification should not fail");
    assert_eq!(outcome.statistics.interleavings, 1);
    assert!(matches!(outcome.verdict, Verdict::Unknown(ref reason) if reason.contains("1 interleavings")));

    let config = BmcConfig::default().with_max_interleavings(Some(1));
    let outcome = Bmc::new(&load_demo("lost_update.gp"), config.with_all_runs(true))
        .run()
        .expect("verification should not fail");
    assert_eq!(outcome.statistics.interleavings, 1);
}

#[test]
fn test_graph_backend_alone_is_unknown() {
    let program = load_demo("lost_update.gp");
    let config = BmcConfig::default().with_backends(vec![BackendKind::Graph]);
    let outcome = Bmc::new(&program, config).run().expect("verification should not fail");
    assert!(matches!(outcome.verdict, Verdict::Unknown(_)));
}

#[test]
fn test_formula_only_never_solves() {
    let program = load_demo("lost_update.gp");
    let config = BmcConfig::default().with_smt_formula_only(true);
    let outcome = Bmc::new(&program, config).run().expect("verification should not fail");
    assert_eq!(outcome.verdict, Verdict::Safe);
    assert_eq!(outcome.statistics.solver_calls, 0);
}

#[test]
fn test_cancelled_run_is_an_error() {
    let program = load_demo("lost_update.gp");
    let token = CancellationToken::new();
    token.cancel();
    let result = Bmc::new(&program, BmcConfig::default())
        .with_cancellation(token)
        .run();
    assert!(matches!(result, Err(SymexError::Cancelled)));
}
