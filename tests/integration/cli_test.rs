use std::process::{Command, Output};

use crate::demo_path;

fn reachtree(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_reachtree"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to execute reachtree")
}

fn demo(name: &str) -> String {
    demo_path(name).to_string_lossy().into_owned()
}

#[test]
fn test_verify_safe_program() {
    let output = reachtree(&["verify", &demo("locked_counter.gp")]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stdout: {}", stdout);
    assert!(stdout.contains("VERIFICATION SUCCESSFUL"));
    assert!(stdout.contains("Interleavings explored"));
}

#[test]
fn test_verify_unsafe_program_exits_nonzero() {
    let output = reachtree(&["verify", &demo("lost_update.gp")]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout.contains("Counterexample:"));
    assert!(stdout.contains("VERIFICATION FAILED"));
}

#[test]
fn test_endianness_flags() {
    let race = demo("big_endian_race.gp");
    let big = reachtree(&["verify", "--big-endian", &race]);
    assert!(String::from_utf8_lossy(&big.stdout).contains("VERIFICATION FAILED"));
    let little = reachtree(&["verify", "--little-endian", &race]);
    assert!(little.status.success());
}

#[test]
fn test_conflicting_endianness_rejected() {
    let output = reachtree(&["verify", "--big-endian", "--little-endian", &demo("loop.gp")]);
    assert!(!output.status.success());
}

#[test]
fn test_check_flags() {
    let deadlock = demo("deadlock.gp");
    assert!(reachtree(&["verify", &deadlock]).status.success());
    let output = reachtree(&["verify", "--deadlock-check", &deadlock]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("deadlock detected"));

    let output = reachtree(&["verify", "--unwind", "2", "--unwinding-assertions", &demo("loop.gp")]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("unwinding assertion"));
}

#[test]
fn test_smt_formula_only_prints_script() {
    let output = reachtree(&["verify", "--smt-formula-only", &demo("lost_update.gp")]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("(set-logic QF_BV)"));
    assert!(!stdout.contains("VERIFICATION"));
}

#[test]
fn test_program_subcommand_prints_program() {
    let output = reachtree(&["program", &demo("locked_counter.gp")]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains(".global m mutex"));
    assert!(stdout.contains(".function inc"));
}

#[test]
fn test_graph_subcommand_prints_json() {
    let output = reachtree(&["graph", &demo("lost_update.gp")]);
    assert!(output.status.success());
    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("graph output should be JSON");
    assert!(json.is_object());
}

#[test]
fn test_missing_file_reports_error() {
    let output = reachtree(&["verify", "no/such/program.gp"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}
