//! Goto-program instruction definitions

use std::fmt;

use crate::ir::expr::Expr;
use crate::ir::symbol::SymbolId;

/// Source position of an instruction (line 0 means unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Location {
    pub line: usize,
}

impl Location {
    pub fn new(line: usize) -> Self {
        Self { line }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "<unknown>")
        } else {
            write!(f, "line {}", self.line)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Assign {
        lhs: SymbolId,
        rhs: Expr,
    },
    Assume(Expr),
    Assert {
        cond: Expr,
        comment: String,
    },
    /// Jump to the instruction at index `target` of the same function,
    /// when `guard` holds (always, if absent)
    Goto {
        guard: Option<Expr>,
        target: usize,
    },
    Call {
        function: SymbolId,
        args: Vec<Expr>,
        ret: Option<SymbolId>,
    },
    Return(Option<Expr>),
    ThreadCreate {
        function: SymbolId,
        args: Vec<Expr>,
        handle: Option<SymbolId>,
    },
    ThreadJoin(SymbolId),
    Lock(SymbolId),
    Unlock(SymbolId),
    AtomicBegin,
    AtomicEnd,
    Skip,
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Assign { .. } => "assign",
            Instruction::Assume(_) => "assume",
            Instruction::Assert { .. } => "assert",
            Instruction::Goto { guard: None, .. } => "goto",
            Instruction::Goto { guard: Some(_), .. } => "if",
            Instruction::Call { .. } => "call",
            Instruction::Return(_) => "return",
            Instruction::ThreadCreate { .. } => "create",
            Instruction::ThreadJoin(_) => "join",
            Instruction::Lock(_) => "lock",
            Instruction::Unlock(_) => "unlock",
            Instruction::AtomicBegin => "atomic_begin",
            Instruction::AtomicEnd => "atomic_end",
            Instruction::Skip => "skip",
        }
    }

    /// Expressions evaluated by this instruction
    pub fn operands(&self) -> Vec<&Expr> {
        match self {
            Instruction::Assign { rhs, .. } => vec![rhs],
            Instruction::Assume(e) => vec![e],
            Instruction::Assert { cond, .. } => vec![cond],
            Instruction::Goto { guard, .. } => guard.iter().collect(),
            Instruction::Call { args, .. } | Instruction::ThreadCreate { args, .. } => {
                args.iter().collect()
            }
            Instruction::Return(e) => e.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Variable written by this instruction, if any
    pub fn written(&self) -> Option<&SymbolId> {
        match self {
            Instruction::Assign { lhs, .. } => Some(lhs),
            Instruction::Call { ret, .. } => ret.as_ref(),
            Instruction::ThreadCreate { handle, .. } => handle.as_ref(),
            Instruction::Lock(m) | Instruction::Unlock(m) => Some(m),
            _ => None,
        }
    }

    /// Every symbol read or written by this instruction
    pub fn accessed_symbols(&self) -> Vec<SymbolId> {
        let mut out = Vec::new();
        for e in self.operands() {
            e.for_each_symbol(&mut |s| {
                if !out.contains(s) {
                    out.push(s.clone());
                }
            });
        }
        let extra = match self {
            Instruction::ThreadJoin(h) => Some(h),
            other => other.written(),
        };
        if let Some(s) = extra {
            if !out.contains(s) {
                out.push(s.clone());
            }
        }
        out
    }

    pub fn is_backward_goto(&self, pc: usize) -> bool {
        matches!(self, Instruction::Goto { target, .. } if *target <= pc)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn call_tail(
            f: &mut fmt::Formatter<'_>,
            function: &SymbolId,
            args: &[Expr],
            out: &Option<SymbolId>,
        ) -> fmt::Result {
            write!(f, " {}", function)?;
            for a in args {
                write!(f, " {}", a)?;
            }
            if let Some(out) = out {
                write!(f, " -> {}", out)?;
            }
            Ok(())
        }

        match self {
            Instruction::Assign { lhs, rhs } => write!(f, "assign {} {}", lhs, rhs),
            Instruction::Assume(e) => write!(f, "assume {}", e),
            Instruction::Assert { cond, comment } => {
                write!(f, "assert {}", cond)?;
                if !comment.is_empty() {
                    write!(f, " {:?}", comment)?;
                }
                Ok(())
            }
            Instruction::Goto {
                guard: None,
                target,
            } => write!(f, "goto @{}", target),
            Instruction::Goto {
                guard: Some(g),
                target,
            } => write!(f, "if {} goto @{}", g, target),
            Instruction::Call {
                function,
                args,
                ret,
            } => {
                write!(f, "call")?;
                call_tail(f, function, args, ret)
            }
            Instruction::Return(None) => write!(f, "return"),
            Instruction::Return(Some(e)) => write!(f, "return {}", e),
            Instruction::ThreadCreate {
                function,
                args,
                handle,
            } => {
                write!(f, "create")?;
                call_tail(f, function, args, handle)
            }
            Instruction::ThreadJoin(h) => write!(f, "join {}", h),
            Instruction::Lock(m) => write!(f, "lock {}", m),
            Instruction::Unlock(m) => write!(f, "unlock {}", m),
            Instruction::AtomicBegin => write!(f, "atomic_begin"),
            Instruction::AtomicEnd => write!(f, "atomic_end"),
            Instruction::Skip => write!(f, "skip"),
        }
    }
}

/// An instruction together with where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub instruction: Instruction,
    pub location: Location,
}

impl Statement {
    pub fn new(instruction: Instruction, location: Location) -> Self {
        Self {
            instruction,
            location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::BinaryOp;

    #[test]
    fn test_accessed_symbols() {
        let insn = Instruction::Assign {
            lhs: SymbolId::new("x"),
            rhs: Expr::binary(BinaryOp::Add, Expr::symbol("flag"), Expr::symbol("x")),
        };
        let names: Vec<String> = insn
            .accessed_symbols()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, vec!["flag", "x"]);
    }

    #[test]
    fn test_backward_goto() {
        let insn = Instruction::Goto {
            guard: None,
            target: 2,
        };
        assert!(insn.is_backward_goto(5));
        assert!(insn.is_backward_goto(2));
        assert!(!insn.is_backward_goto(1));
    }

    #[test]
    fn test_display() {
        let insn = Instruction::ThreadCreate {
            function: SymbolId::new("t_fun"),
            args: vec![Expr::Literal(0)],
            handle: Some(SymbolId::new("t")),
        };
        assert_eq!(insn.to_string(), "create t_fun 0 -> t");
    }
}
