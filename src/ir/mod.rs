//! Goto-program representation consumed by the symbolic execution engine
//!
//! A program is a set of goto functions (instruction lists with explicit
//! jump targets) plus global variables. It is immutable once constructed.

pub mod expr;
pub mod instructions;
pub mod program;
pub mod symbol;
pub mod types;

// Re-export commonly used types
pub use expr::{BinaryOp, Expr, UnaryOp};
pub use instructions::{Instruction, Location, Statement};
pub use program::{GotoFunction, GotoProgram, ProgramError, Scope, Variable};
pub use symbol::SymbolId;
pub use types::{Endianness, Type};
