//! Which globals need context-switch points
//!
//! A global only matters for interleavings when at least two threads can
//! touch it. Every function reachable from a thread root (the entry point,
//! or a `create` target) counts as run by that root. A create site inside a
//! loop, or in a function run by more than one thread, may start several
//! threads and counts twice.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::ir::{GotoProgram, Instruction, SymbolId};

#[derive(Debug, Clone, Default)]
pub struct SharedAccess {
    shared: BTreeSet<SymbolId>,
}

impl SharedAccess {
    /// Every global is a switch point
    pub fn everything(program: &GotoProgram) -> Self {
        Self {
            shared: program.globals().iter().map(|g| g.name.clone()).collect(),
        }
    }

    pub fn analyze(program: &GotoProgram) -> Self {
        let mut instances: BTreeMap<SymbolId, u32> = BTreeMap::new();
        instances.insert(program.entry().clone(), 1);

        // Thread instance counts grow monotonically and saturate at 2.
        loop {
            let mut next: BTreeMap<SymbolId, u32> = BTreeMap::new();
            next.insert(program.entry().clone(), 1);
            for (root, &count) in &instances {
                for func in reachable(program, root) {
                    let Some(body) = program.function(&func) else {
                        continue;
                    };
                    for (pc, stmt) in body.body.iter().enumerate() {
                        if let Instruction::ThreadCreate { function, .. } = &stmt.instruction {
                            let weight = if count > 1 || in_loop(program, &func, pc) { 2 } else { 1 };
                            let entry = next.entry(function.clone()).or_insert(0);
                            *entry = (*entry + weight).min(2);
                        }
                    }
                }
            }
            if next == instances {
                break;
            }
            instances = next;
        }

        let mut touched: BTreeMap<SymbolId, u32> = BTreeMap::new();
        for (root, &count) in &instances {
            let mut globals = BTreeSet::new();
            for func in reachable(program, root) {
                let Some(body) = program.function(&func) else {
                    continue;
                };
                for stmt in &body.body {
                    for sym in stmt.instruction.accessed_symbols() {
                        if body.variable(&sym).is_none() && program.global(&sym).is_some() {
                            globals.insert(sym);
                        }
                    }
                }
            }
            for g in globals {
                *touched.entry(g).or_insert(0) += count;
            }
        }
        let shared: BTreeSet<SymbolId> = touched
            .into_iter()
            .filter(|(_, n)| *n >= 2)
            .map(|(g, _)| g)
            .collect();
        debug!(shared = ?shared, "shared globals");
        Self { shared }
    }

    pub fn is_shared(&self, name: &SymbolId) -> bool {
        self.shared.contains(name)
    }

    pub fn shared(&self) -> impl Iterator<Item = &SymbolId> {
        self.shared.iter()
    }
}

/// Functions reachable from `root` through calls (not thread creation)
fn reachable(program: &GotoProgram, root: &SymbolId) -> BTreeSet<SymbolId> {
    let mut seen = BTreeSet::new();
    let mut work = vec![root.clone()];
    while let Some(func) = work.pop() {
        if !seen.insert(func.clone()) {
            continue;
        }
        if let Some(body) = program.function(&func) {
            for stmt in &body.body {
                if let Instruction::Call { function, .. } = &stmt.instruction {
                    work.push(function.clone());
                }
            }
        }
    }
    seen
}

/// Whether `pc` lies between a backward goto and its target
fn in_loop(program: &GotoProgram, function: &SymbolId, pc: usize) -> bool {
    program.function(function).is_some_and(|f| {
        f.body.iter().enumerate().any(|(from, stmt)| match &stmt.instruction {
            Instruction::Goto { target, .. } => *target <= pc && pc <= from,
            _ => false,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    #[test]
    fn test_global_touched_by_two_threads_is_shared() {
        let program = parse_program(
            "\
.global flag bool
.global mine i32
.global seen i32
.function worker
    assign flag true
.end
.function main
.local t thread
    assign mine 1
    create worker -> t
    assign seen (ite flag 1 0)
.end
",
        )
        .unwrap();
        let shared = SharedAccess::analyze(&program);
        assert!(shared.is_shared(&SymbolId::new("flag")));
        assert!(!shared.is_shared(&SymbolId::new("mine")));
        assert!(!shared.is_shared(&SymbolId::new("seen")));

        let all = SharedAccess::everything(&program);
        assert!(all.is_shared(&SymbolId::new("mine")));
    }

    #[test]
    fn test_thread_created_in_loop_shares_with_itself() {
        let program = parse_program(
            "\
.global counter i32
.function worker
    assign counter (+ counter 1)
.end
.function main
.local i i32
.local t thread
    assign i 0
top:
    if (>= i 2) goto done
    create worker -> t
    assign i (+ i 1)
    goto top
done:
.end
",
        )
        .unwrap();
        let shared = SharedAccess::analyze(&program);
        assert!(shared.is_shared(&SymbolId::new("counter")));
    }
}
