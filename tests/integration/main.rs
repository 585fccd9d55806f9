mod bmc_test;
mod cli_test;
mod symex_test;

use std::path::PathBuf;

use reachtree::ir::GotoProgram;
use reachtree::parser::{parse_file, parse_program};

pub fn demo_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

pub fn load_demo(name: &str) -> GotoProgram {
    parse_file(&demo_path(name)).expect("demo program should parse")
}

pub fn program(src: &str) -> GotoProgram {
    parse_program(src).expect("test program should parse")
}
