//! Bounded model checking of multi-threaded goto programs
//!
//! - [`ir`]: the goto-program representation
//! - [`parser`]: the textual goto-program format
//! - [`symex`]: reachability-tree symbolic execution
//! - [`smt`]: solver-independent queries and the backends that decide them
//! - [`bmc`]: the verification driver tying the above together

pub mod bmc;
pub mod ir;
pub mod parser;
pub mod smt;
pub mod symex;
