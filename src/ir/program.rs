//! Goto functions, the program container, and its namespace

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;

use crate::ir::expr::Expr;
use crate::ir::instructions::{Instruction, Location, Statement};
use crate::ir::symbol::SymbolId;
use crate::ir::types::Type;

/// Malformed program representation. Always fatal for a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("unresolved symbol `{symbol}` in function `{function}` at {location}")]
    UnresolvedSymbol {
        symbol: SymbolId,
        function: SymbolId,
        location: Location,
    },
    #[error("call to undefined function `{callee}` in `{function}` at {location}")]
    UndefinedFunction {
        callee: SymbolId,
        function: SymbolId,
        location: Location,
    },
    #[error("entry point `{0}` is not defined")]
    MissingEntry(SymbolId),
    #[error("entry point `{0}` must not take parameters")]
    EntryTakesParameters(SymbolId),
    #[error("jump target {target} out of range in function `{function}` at {location}")]
    BadJumpTarget {
        target: usize,
        function: SymbolId,
        location: Location,
    },
    #[error("`{callee}` expects {expected} arguments, got {found} (in `{function}` at {location})")]
    ArityMismatch {
        callee: SymbolId,
        expected: usize,
        found: usize,
        function: SymbolId,
        location: Location,
    },
    #[error("type error in `{function}` at {location}: {message}")]
    TypeMismatch {
        function: SymbolId,
        location: Location,
        message: String,
    },
    #[error("duplicate definition of `{0}`")]
    Duplicate(SymbolId),
}

/// Where a name lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Parameter,
    Local,
}

/// A declared variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: SymbolId,
    pub ty: Type,
    /// Initial value (globals only); absent means zero
    pub init: Option<Expr>,
}

impl Variable {
    pub fn new(name: impl AsRef<str>, ty: Type) -> Self {
        Self {
            name: SymbolId::new(name),
            ty,
            init: None,
        }
    }

    pub fn with_init(mut self, init: Expr) -> Self {
        self.init = Some(init);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GotoFunction {
    pub name: SymbolId,
    pub params: Vec<Variable>,
    pub locals: Vec<Variable>,
    pub return_type: Option<Type>,
    pub body: Vec<Statement>,
    /// Label names by instruction index, kept for listings
    pub labels: BTreeMap<usize, String>,
}

impl GotoFunction {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: SymbolId::new(name),
            params: Vec::new(),
            locals: Vec::new(),
            return_type: None,
            body: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Index of the implicit end-of-function instruction
    pub fn end_index(&self) -> usize {
        self.body.len()
    }

    pub fn variable(&self, name: &SymbolId) -> Option<(&Variable, Scope)> {
        if let Some(v) = self.params.iter().find(|v| &v.name == name) {
            return Some((v, Scope::Parameter));
        }
        self.locals
            .iter()
            .find(|v| &v.name == name)
            .map(|v| (v, Scope::Local))
    }

    /// Location of instruction `pc`, or of the last instruction for the end
    pub fn location(&self, pc: usize) -> Location {
        self.body
            .get(pc)
            .or_else(|| self.body.last())
            .map(|s| s.location)
            .unwrap_or_default()
    }
}

impl fmt::Display for GotoFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".function {}", self.name)?;
        for p in &self.params {
            write!(f, " {}:{}", p.name, p.ty)?;
        }
        if let Some(ret) = &self.return_type {
            write!(f, " -> {}", ret)?;
        }
        writeln!(f)?;
        for l in &self.locals {
            writeln!(f, "    .local {} {}", l.name, l.ty)?;
        }
        for (pc, stmt) in self.body.iter().enumerate() {
            if let Some(label) = self.labels.get(&pc) {
                writeln!(f, "{}:", label)?;
            }
            writeln!(f, "    {:>3}: {}", pc, stmt.instruction)?;
        }
        if let Some(label) = self.labels.get(&self.body.len()) {
            writeln!(f, "{}:", label)?;
        }
        writeln!(f, ".end")
    }
}

/// Complete program: globals, functions, and the entry point.
///
/// Construction validates every symbol, jump target and call, so the engine
/// can rely on a well-formed control-flow graph.
#[derive(Debug, Clone)]
pub struct GotoProgram {
    globals: Vec<Variable>,
    global_index: HashMap<SymbolId, usize>,
    functions: BTreeMap<SymbolId, GotoFunction>,
    entry: SymbolId,
}

impl GotoProgram {
    pub fn new(
        globals: Vec<Variable>,
        functions: Vec<GotoFunction>,
        entry: impl AsRef<str>,
    ) -> Result<Self, ProgramError> {
        let mut global_index = HashMap::new();
        for (i, g) in globals.iter().enumerate() {
            if global_index.insert(g.name.clone(), i).is_some() {
                return Err(ProgramError::Duplicate(g.name.clone()));
            }
        }
        let mut function_map = BTreeMap::new();
        for func in functions {
            let name = func.name.clone();
            if function_map.insert(name.clone(), func).is_some() {
                return Err(ProgramError::Duplicate(name));
            }
        }
        let program = Self {
            globals,
            global_index,
            functions: function_map,
            entry: SymbolId::new(entry),
        };
        program.validate()?;
        Ok(program)
    }

    pub fn entry(&self) -> &SymbolId {
        &self.entry
    }

    pub fn globals(&self) -> &[Variable] {
        &self.globals
    }

    pub fn global(&self, name: &SymbolId) -> Option<&Variable> {
        self.global_index.get(name).map(|&i| &self.globals[i])
    }

    pub fn functions(&self) -> impl Iterator<Item = &GotoFunction> {
        self.functions.values()
    }

    pub fn function(&self, name: &SymbolId) -> Option<&GotoFunction> {
        self.functions.get(name)
    }

    /// Resolve `name` as seen from inside `function`: locals shadow globals.
    pub fn lookup(&self, function: &SymbolId, name: &SymbolId) -> Option<(Type, Scope)> {
        if let Some((v, scope)) = self
            .functions
            .get(function)
            .and_then(|f| f.variable(name))
        {
            return Some((v.ty, scope));
        }
        self.global(name).map(|g| (g.ty, Scope::Global))
    }

    fn validate(&self) -> Result<(), ProgramError> {
        let entry = self
            .functions
            .get(&self.entry)
            .ok_or_else(|| ProgramError::MissingEntry(self.entry.clone()))?;
        if !entry.params.is_empty() {
            return Err(ProgramError::EntryTakesParameters(self.entry.clone()));
        }

        for g in &self.globals {
            if let Some(init) = &g.init {
                if let Some(sym) = init.symbols().into_iter().next() {
                    return Err(ProgramError::TypeMismatch {
                        function: SymbolId::new("<globals>"),
                        location: Location::default(),
                        message: format!(
                            "initializer of `{}` must be constant, found `{}`",
                            g.name, sym
                        ),
                    });
                }
            }
        }

        for func in self.functions.values() {
            let mut seen = HashMap::new();
            for v in func.params.iter().chain(&func.locals) {
                if seen.insert(v.name.clone(), ()).is_some() {
                    return Err(ProgramError::Duplicate(v.name.clone()));
                }
            }
            for stmt in &func.body {
                self.validate_statement(func, stmt)?;
            }
        }
        Ok(())
    }

    fn validate_statement(&self, func: &GotoFunction, stmt: &Statement) -> Result<(), ProgramError> {
        let location = stmt.location;
        let type_error = |message: String| ProgramError::TypeMismatch {
            function: func.name.clone(),
            location,
            message,
        };

        for sym in stmt.instruction.accessed_symbols() {
            if self.lookup(&func.name, &sym).is_none() {
                return Err(ProgramError::UnresolvedSymbol {
                    symbol: sym,
                    function: func.name.clone(),
                    location,
                });
            }
        }
        let type_of = |s: &SymbolId| self.lookup(&func.name, s).map(|(t, _)| t);

        let mut byte_error = None;
        for operand in stmt.instruction.operands() {
            operand.for_each_subexpr(&mut |e| {
                if let Expr::Byte { arg, index } = e {
                    let ty = arg.natural_type(&type_of).unwrap_or(Type::I32);
                    let in_range = match ty.width() {
                        Some(w) if w % 8 == 0 => u64::from(*index) < u64::from(w / 8),
                        _ => false,
                    };
                    if !in_range && byte_error.is_none() {
                        byte_error = Some(format!(
                            "byte {} is out of range for a value of type {}",
                            index, ty
                        ));
                    }
                }
            });
        }
        if let Some(message) = byte_error {
            return Err(type_error(message));
        }

        match &stmt.instruction {
            Instruction::Goto { target, .. } => {
                if *target > func.end_index() {
                    return Err(ProgramError::BadJumpTarget {
                        target: *target,
                        function: func.name.clone(),
                        location,
                    });
                }
            }
            Instruction::Call {
                function,
                args,
                ret,
            }
            | Instruction::ThreadCreate {
                function,
                args,
                handle: ret,
            } => {
                let callee =
                    self.functions
                        .get(function)
                        .ok_or_else(|| ProgramError::UndefinedFunction {
                            callee: function.clone(),
                            function: func.name.clone(),
                            location,
                        })?;
                if callee.params.len() != args.len() {
                    return Err(ProgramError::ArityMismatch {
                        callee: function.clone(),
                        expected: callee.params.len(),
                        found: args.len(),
                        function: func.name.clone(),
                        location,
                    });
                }
                let is_create = matches!(stmt.instruction, Instruction::ThreadCreate { .. });
                if let Some(out) = ret {
                    let ty = type_of(out);
                    if is_create && ty != Some(Type::Thread) {
                        return Err(type_error(format!(
                            "thread handle `{}` must have type thread",
                            out
                        )));
                    }
                    if ty == Some(Type::Mutex) {
                        return Err(type_error(format!("cannot assign to mutex `{}`", out)));
                    }
                }
            }
            Instruction::Assign { lhs, .. } => {
                if type_of(lhs) == Some(Type::Mutex) {
                    return Err(type_error(format!(
                        "cannot assign to mutex `{}`, use lock/unlock",
                        lhs
                    )));
                }
            }
            Instruction::Lock(m) | Instruction::Unlock(m) => {
                if type_of(m) != Some(Type::Mutex) {
                    return Err(type_error(format!("`{}` is not a mutex", m)));
                }
            }
            Instruction::ThreadJoin(h) => {
                if type_of(h) != Some(Type::Thread) {
                    return Err(type_error(format!("`{}` is not a thread handle", h)));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for GotoProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for g in &self.globals {
            write!(f, ".global {} {}", g.name, g.ty)?;
            if let Some(init) = &g.init {
                write!(f, " {}", init)?;
            }
            writeln!(f)?;
        }
        if self.entry.as_str() != "main" {
            writeln!(f, ".entry {}", self.entry)?;
        }
        for func in self.functions.values() {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(instruction: Instruction, line: usize) -> Statement {
        Statement::new(instruction, Location::new(line))
    }

    fn main_with(body: Vec<Statement>) -> GotoFunction {
        let mut main = GotoFunction::new("main");
        main.locals.push(Variable::new("x", Type::I32));
        main.body = body;
        main
    }

    #[test]
    fn test_valid_program() {
        let main = main_with(vec![stmt(
            Instruction::Assign {
                lhs: SymbolId::new("x"),
                rhs: Expr::symbol("g"),
            },
            1,
        )]);
        let program =
            GotoProgram::new(vec![Variable::new("g", Type::I32)], vec![main], "main").unwrap();
        assert_eq!(
            program.lookup(&SymbolId::new("main"), &SymbolId::new("x")),
            Some((Type::I32, Scope::Local))
        );
        assert_eq!(
            program.lookup(&SymbolId::new("main"), &SymbolId::new("g")),
            Some((Type::I32, Scope::Global))
        );
    }

    #[test]
    fn test_unresolved_symbol_rejected() {
        let main = main_with(vec![stmt(Instruction::Assume(Expr::symbol("missing")), 7)]);
        let err = GotoProgram::new(vec![], vec![main], "main").unwrap_err();
        assert!(matches!(
            err,
            ProgramError::UnresolvedSymbol { ref symbol, location, .. }
                if symbol.as_str() == "missing" && location.line == 7
        ));
    }

    #[test]
    fn test_bad_jump_target_rejected() {
        let main = main_with(vec![stmt(
            Instruction::Goto {
                guard: None,
                target: 9,
            },
            1,
        )]);
        let err = GotoProgram::new(vec![], vec![main], "main").unwrap_err();
        assert!(matches!(err, ProgramError::BadJumpTarget { target: 9, .. }));
    }

    #[test]
    fn test_missing_entry_and_arity() {
        let err = GotoProgram::new(vec![], vec![GotoFunction::new("f")], "main").unwrap_err();
        assert_eq!(err, ProgramError::MissingEntry(SymbolId::new("main")));

        let mut callee = GotoFunction::new("f");
        callee.params.push(Variable::new("a", Type::I32));
        let main = main_with(vec![stmt(
            Instruction::Call {
                function: SymbolId::new("f"),
                args: vec![],
                ret: None,
            },
            3,
        )]);
        let err = GotoProgram::new(vec![], vec![main, callee], "main").unwrap_err();
        assert!(matches!(
            err,
            ProgramError::ArityMismatch {
                expected: 1,
                found: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_byte_index_in_range() {
        let byte = |index| {
            main_with(vec![stmt(
                Instruction::Assign {
                    lhs: SymbolId::new("x"),
                    rhs: Expr::Byte {
                        arg: Box::new(Expr::symbol("x")),
                        index,
                    },
                },
                4,
            )])
        };
        assert!(GotoProgram::new(vec![], vec![byte(3)], "main").is_ok());
        for index in [4, u32::MAX] {
            let err = GotoProgram::new(vec![], vec![byte(index)], "main").unwrap_err();
            assert!(matches!(err, ProgramError::TypeMismatch { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_lock_requires_mutex() {
        let main = main_with(vec![stmt(Instruction::Lock(SymbolId::new("x")), 2)]);
        let err = GotoProgram::new(vec![], vec![main], "main").unwrap_err();
        assert!(matches!(err, ProgramError::TypeMismatch { .. }));
    }
}
