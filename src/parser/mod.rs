//! Text parser for goto programs
//!
//! One directive or instruction per line:
//!
//! ```text
//! .global flag bool false
//! .function worker n:i32 -> i32
//! .local x i32
//! loop:
//!     assign x (+ x n)
//!     if (< x 10) goto loop
//!     return x
//! .end
//! ```
//!
//! Expressions are prefix S-expressions. `#` and `;` start a comment.

use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::ir::{
    BinaryOp, Expr, GotoFunction, GotoProgram, Instruction, Location, ProgramError, Statement,
    SymbolId, Type, UnaryOp, Variable,
};

/// Parse error with location information
#[derive(Debug, Clone)]
pub struct ParseError {
    pub line_number: usize,
    pub column: Option<usize>,
    pub message: String,
    pub line_content: String,
}

impl ParseError {
    pub fn new(
        line_number: usize,
        message: impl Into<String>,
        line_content: impl Into<String>,
    ) -> Self {
        Self {
            line_number,
            column: None,
            message: message.into(),
            line_content: line_content.into(),
        }
    }

    pub fn with_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = self.column {
            write!(
                f,
                "line {}, column {}: {}\n  | {}\n  | {}^",
                self.line_number,
                col,
                self.message,
                self.line_content,
                " ".repeat(col.saturating_sub(1))
            )
        } else {
            write!(
                f,
                "line {}: {}\n  | {}",
                self.line_number, self.message, self.line_content
            )
        }
    }
}

impl std::error::Error for ParseError {}

/// Failure to turn a file into a validated program
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error at {0}")]
    Parse(#[from] ParseError),
    #[error("invalid program: {0}")]
    Program(#[from] ProgramError),
}

/// Lexical token with its 1-based column
#[derive(Debug, Clone, PartialEq)]
struct Token {
    text: TokenKind,
    column: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Open,
    Close,
    Str(String),
    Atom(String),
}

/// Parse error without a line attached yet
#[derive(Debug, Clone, PartialEq)]
struct LineError {
    message: String,
    column: Option<usize>,
}

impl LineError {
    fn at(column: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            column: Some(column),
        }
    }

    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            column: None,
        }
    }
}

impl From<String> for LineError {
    fn from(message: String) -> Self {
        LineError::new(message)
    }
}

fn tokenize(line: &str) -> Result<Vec<Token>, LineError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let column = i + 1;
        match c {
            '#' | ';' => break,
            '(' => {
                tokens.push(Token {
                    text: TokenKind::Open,
                    column,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    text: TokenKind::Close,
                    column,
                });
                i += 1;
            }
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(next);
                            }
                            i += 2;
                        }
                        Some(&other) => {
                            s.push(other);
                            i += 1;
                        }
                        None => return Err(LineError::at(column, "unterminated string")),
                    }
                }
                i += 1;
                tokens.push(Token {
                    text: TokenKind::Str(s),
                    column,
                });
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '"' | '#' | ';')
                {
                    i += 1;
                }
                tokens.push(Token {
                    text: TokenKind::Atom(chars[start..i].iter().collect()),
                    column,
                });
            }
        }
    }
    Ok(tokens)
}

/// Parse an integer literal (decimal or hex, optionally negative)
pub fn parse_literal(s: &str) -> Result<i128, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty literal".to_string());
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).map_err(|e| format!("invalid hex literal '{}': {}", s, e))
    } else if let Some(hex) = s.strip_prefix("-0x").or_else(|| s.strip_prefix("-0X")) {
        i128::from_str_radix(hex, 16)
            .map(|v| -v)
            .map_err(|e| format!("invalid hex literal '{}': {}", s, e))
    } else {
        s.parse::<i128>()
            .map_err(|e| format!("invalid literal '{}': {}", s, e))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'))
}

fn parse_type(tok: &Token) -> Result<Type, LineError> {
    match &tok.text {
        TokenKind::Atom(a) => a.parse().map_err(|e: String| LineError::at(tok.column, e)),
        _ => Err(LineError::at(tok.column, "expected a type")),
    }
}

/// Recursive-descent reader over one line's tokens
struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    end_column: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token], line: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            end_column: line.chars().count() + 1,
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn column(&self) -> usize {
        self.peek().map(|t| t.column).unwrap_or(self.end_column)
    }

    fn expect_atom(&mut self, what: &str) -> Result<(&'a str, usize), LineError> {
        match self.next() {
            Some(Token {
                text: TokenKind::Atom(a),
                column,
            }) => Ok((a.as_str(), *column)),
            Some(t) => Err(LineError::at(t.column, format!("expected {}", what))),
            None => Err(LineError::at(self.end_column, format!("expected {}", what))),
        }
    }

    fn expect_symbol(&mut self, what: &str) -> Result<SymbolId, LineError> {
        let (name, column) = self.expect_atom(what)?;
        if !is_identifier(name) {
            return Err(LineError::at(column, format!("invalid {} '{}'", what, name)));
        }
        Ok(SymbolId::new(name))
    }

    fn expect_end(&self) -> Result<(), LineError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(LineError::at(t.column, "unexpected trailing input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, LineError> {
        let tok = self
            .next()
            .ok_or_else(|| LineError::at(self.end_column, "expected an expression"))?;
        match &tok.text {
            TokenKind::Close => Err(LineError::at(tok.column, "unexpected ')'")),
            TokenKind::Str(_) => Err(LineError::at(tok.column, "unexpected string")),
            TokenKind::Atom(a) => atom_expr(a, tok.column),
            TokenKind::Open => {
                let (head, head_col) = self.expect_atom("an operator")?;
                let expr = self.compound(head, head_col)?;
                match self.next() {
                    Some(Token {
                        text: TokenKind::Close,
                        ..
                    }) => Ok(expr),
                    Some(t) => Err(LineError::at(t.column, "expected ')'")),
                    None => Err(LineError::at(self.end_column, "missing ')'")),
                }
            }
        }
    }

    /// Operands up to (not including) the closing paren
    fn operands(&mut self) -> Result<Vec<Expr>, LineError> {
        let mut args = Vec::new();
        loop {
            match self.peek() {
                None => return Err(LineError::at(self.end_column, "missing ')'")),
                Some(t) if t.text == TokenKind::Close => return Ok(args),
                Some(_) => args.push(self.expr()?),
            }
        }
    }

    fn compound(&mut self, head: &str, column: usize) -> Result<Expr, LineError> {
        match head {
            "ite" => {
                let cond = self.expr()?;
                let then = self.expr()?;
                let els = self.expr()?;
                Ok(Expr::ite(cond, then, els))
            }
            "cast" => {
                let tok = self
                    .next()
                    .ok_or_else(|| LineError::at(self.end_column, "expected a type"))?;
                let ty = parse_type(tok)?;
                Ok(Expr::cast(ty, self.expr()?))
            }
            "byte" => {
                let arg = self.expr()?;
                let (idx, idx_col) = self.expect_atom("a byte index")?;
                let index = idx
                    .parse::<u32>()
                    .map_err(|_| LineError::at(idx_col, format!("invalid byte index '{}'", idx)))?;
                Ok(Expr::Byte {
                    arg: Box::new(arg),
                    index,
                })
            }
            "nondet" => {
                let tok = self
                    .next()
                    .ok_or_else(|| LineError::at(self.end_column, "expected a type"))?;
                Ok(Expr::Nondet(Some(parse_type(tok)?)))
            }
            _ => {
                let args = self.operands()?;
                let unary = match head {
                    "!" => Some(UnaryOp::Not),
                    "~" => Some(UnaryOp::BitNot),
                    "-" if args.len() == 1 => Some(UnaryOp::Neg),
                    _ => None,
                };
                if let Some(op) = unary {
                    let mut args = args;
                    return match (args.pop(), args.is_empty()) {
                        (Some(arg), true) => Ok(Expr::unary(op, arg)),
                        _ => Err(LineError::at(
                            column,
                            format!("'{}' takes one operand", head),
                        )),
                    };
                }
                let op = BinaryOp::from_token(head)
                    .ok_or_else(|| LineError::at(column, format!("unknown operator '{}'", head)))?;
                if args.len() < 2 {
                    return Err(LineError::at(
                        column,
                        format!("'{}' needs at least two operands", head),
                    ));
                }
                if op.is_comparison() && args.len() != 2 {
                    return Err(LineError::at(
                        column,
                        format!("'{}' takes exactly two operands", head),
                    ));
                }
                let mut iter = args.into_iter();
                let first = iter
                    .next()
                    .ok_or_else(|| LineError::at(column, "missing operand"))?;
                Ok(iter.fold(first, |acc, e| Expr::binary(op, acc, e)))
            }
        }
    }
}

fn atom_expr(atom: &str, column: usize) -> Result<Expr, LineError> {
    match atom {
        "true" => return Ok(Expr::Bool(true)),
        "false" => return Ok(Expr::Bool(false)),
        "nondet" => return Ok(Expr::Nondet(None)),
        _ => {}
    }
    if atom.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return parse_literal(atom)
            .map(Expr::Literal)
            .map_err(|e| LineError::at(column, e));
    }
    if is_identifier(atom) {
        Ok(Expr::symbol(atom))
    } else {
        Err(LineError::at(column, format!("invalid expression '{}'", atom)))
    }
}

/// Parse a single expression
pub fn parse_expr(text: &str) -> Result<Expr, ParseError> {
    let to_err = |e: LineError| {
        let err = ParseError::new(1, e.message, text);
        match e.column {
            Some(c) => err.with_column(c),
            None => err,
        }
    };
    let tokens = tokenize(text).map_err(to_err)?;
    let mut cursor = Cursor::new(&tokens, text);
    let expr = cursor.expr().map_err(to_err)?;
    cursor.expect_end().map_err(to_err)?;
    Ok(expr)
}

/// Jump target as written
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Label(String),
    Index(usize),
}

/// Result of parsing a single line
#[derive(Debug, Clone, PartialEq)]
pub enum LineResult {
    Global(Variable),
    Entry(SymbolId),
    Function {
        name: SymbolId,
        params: Vec<Variable>,
        return_type: Option<Type>,
    },
    Local(Variable),
    End,
    Label(String),
    /// An instruction; gotos carry their unresolved target
    Instruction(Instruction, Option<Target>),
    /// Blank or comment-only line
    Skip,
}

fn parse_target(cursor: &mut Cursor<'_>) -> Result<(Target, usize), LineError> {
    let (t, column) = cursor.expect_atom("a jump target")?;
    if let Some(idx) = t.strip_prefix('@') {
        let idx = idx
            .parse::<usize>()
            .map_err(|_| LineError::at(column, format!("invalid jump index '{}'", t)))?;
        return Ok((Target::Index(idx), column));
    }
    if !is_identifier(t) {
        return Err(LineError::at(column, format!("invalid label '{}'", t)));
    }
    Ok((Target::Label(t.to_string()), column))
}

/// `NAME ARGS* [-> OUT]`, shared by call and create
fn parse_call_tail(
    cursor: &mut Cursor<'_>,
) -> Result<(SymbolId, Vec<Expr>, Option<SymbolId>), LineError> {
    let function = cursor.expect_symbol("a function name")?;
    let mut args = Vec::new();
    let mut out = None;
    while let Some(t) = cursor.peek() {
        if t.text == TokenKind::Atom("->".into()) {
            cursor.next();
            out = Some(cursor.expect_symbol("a result variable")?);
            break;
        }
        args.push(cursor.expr()?);
    }
    Ok((function, args, out))
}

fn parse_directive(directive: &str, column: usize, cursor: &mut Cursor<'_>) -> Result<LineResult, LineError> {
    let result = match directive {
        ".global" => {
            let name = cursor.expect_symbol("a variable name")?;
            let ty_tok = cursor
                .next()
                .ok_or_else(|| LineError::at(cursor.column(), "expected a type"))?;
            let ty = parse_type(ty_tok)?;
            let mut var = Variable {
                name,
                ty,
                init: None,
            };
            if !cursor.is_done() {
                var.init = Some(cursor.expr()?);
            }
            LineResult::Global(var)
        }
        ".local" => {
            let name = cursor.expect_symbol("a variable name")?;
            let ty_tok = cursor
                .next()
                .ok_or_else(|| LineError::at(cursor.column(), "expected a type"))?;
            LineResult::Local(Variable {
                name,
                ty: parse_type(ty_tok)?,
                init: None,
            })
        }
        ".entry" => LineResult::Entry(cursor.expect_symbol("a function name")?),
        ".function" => {
            let name = cursor.expect_symbol("a function name")?;
            let mut params = Vec::new();
            let mut return_type = None;
            while let Some(tok) = cursor.next() {
                let TokenKind::Atom(a) = &tok.text else {
                    return Err(LineError::at(tok.column, "expected a parameter"));
                };
                if a == "->" {
                    let ty_tok = cursor
                        .next()
                        .ok_or_else(|| LineError::at(cursor.column(), "expected a return type"))?;
                    return_type = Some(parse_type(ty_tok)?);
                    break;
                }
                let (pname, pty) = a.split_once(':').ok_or_else(|| {
                    LineError::at(tok.column, format!("expected NAME:TYPE, found '{}'", a))
                })?;
                if !is_identifier(pname) {
                    return Err(LineError::at(tok.column, format!("invalid parameter '{}'", pname)));
                }
                let ty = pty
                    .parse::<Type>()
                    .map_err(|e| LineError::at(tok.column + pname.len() + 1, e))?;
                params.push(Variable::new(pname, ty));
            }
            LineResult::Function {
                name,
                params,
                return_type,
            }
        }
        ".end" => LineResult::End,
        other => {
            return Err(LineError::at(column, format!("unknown directive '{}'", other)));
        }
    };
    cursor.expect_end()?;
    Ok(result)
}

fn parse_tokens(tokens: &[Token], line: &str) -> Result<LineResult, LineError> {
    let mut cursor = Cursor::new(tokens, line);
    let (head, column) = match cursor.peek() {
        None => return Ok(LineResult::Skip),
        Some(Token {
            text: TokenKind::Atom(a),
            column,
        }) => (a.as_str(), *column),
        Some(t) => return Err(LineError::at(t.column, "expected an instruction")),
    };
    cursor.next();

    // listings prefix each instruction with its index, e.g. `  3: skip`
    if head
        .strip_suffix(':')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    {
        return parse_tokens(&tokens[1..], line);
    }

    if head.starts_with('.') {
        return parse_directive(head, column, &mut cursor);
    }
    if let Some(label) = head.strip_suffix(':') {
        if !is_identifier(label) {
            return Err(LineError::at(column, format!("invalid label '{}'", label)));
        }
        cursor.expect_end()?;
        return Ok(LineResult::Label(label.to_string()));
    }

    let mut target = None;
    let instruction = match head.to_lowercase().as_str() {
        "assign" => {
            let lhs = cursor.expect_symbol("a variable")?;
            let rhs = cursor.expr()?;
            Instruction::Assign { lhs, rhs }
        }
        "assume" => Instruction::Assume(cursor.expr()?),
        "assert" => {
            let cond = cursor.expr()?;
            let comment = match cursor.peek() {
                Some(Token {
                    text: TokenKind::Str(s),
                    ..
                }) => {
                    cursor.next();
                    s.clone()
                }
                _ => String::new(),
            };
            Instruction::Assert { cond, comment }
        }
        "goto" => {
            target = Some(parse_target(&mut cursor)?.0);
            Instruction::Goto {
                guard: None,
                target: 0,
            }
        }
        "if" => {
            let guard = cursor.expr()?;
            let (kw, kw_col) = cursor.expect_atom("'goto'")?;
            if kw != "goto" {
                return Err(LineError::at(kw_col, "expected 'goto'"));
            }
            target = Some(parse_target(&mut cursor)?.0);
            Instruction::Goto {
                guard: Some(guard),
                target: 0,
            }
        }
        "call" => {
            let (function, args, ret) = parse_call_tail(&mut cursor)?;
            Instruction::Call {
                function,
                args,
                ret,
            }
        }
        "return" => {
            if cursor.is_done() {
                Instruction::Return(None)
            } else {
                Instruction::Return(Some(cursor.expr()?))
            }
        }
        "create" => {
            let (function, args, handle) = parse_call_tail(&mut cursor)?;
            Instruction::ThreadCreate {
                function,
                args,
                handle,
            }
        }
        "join" => Instruction::ThreadJoin(cursor.expect_symbol("a thread handle")?),
        "lock" => Instruction::Lock(cursor.expect_symbol("a mutex")?),
        "unlock" => Instruction::Unlock(cursor.expect_symbol("a mutex")?),
        "atomic_begin" => Instruction::AtomicBegin,
        "atomic_end" => Instruction::AtomicEnd,
        "skip" => Instruction::Skip,
        _ => {
            return Err(LineError::at(column, format!("unknown instruction: {}", head)));
        }
    };
    cursor.expect_end()?;
    Ok(LineResult::Instruction(instruction, target))
}

/// Parse a single line
pub fn parse_line(line: &str) -> Result<LineResult, ParseError> {
    let to_err = |e: LineError| {
        let err = ParseError::new(0, e.message, line);
        match e.column {
            Some(c) => err.with_column(c),
            None => err,
        }
    };
    let tokens = tokenize(line).map_err(to_err)?;
    parse_tokens(&tokens, line).map_err(to_err)
}

struct PendingJump {
    pc: usize,
    label: String,
    line_number: usize,
}

struct FunctionBuilder {
    function: GotoFunction,
    jumps: Vec<PendingJump>,
    label_pcs: Vec<(String, usize)>,
}

impl FunctionBuilder {
    fn new(name: SymbolId, params: Vec<Variable>, return_type: Option<Type>) -> Self {
        let mut function = GotoFunction::new(name.as_str());
        function.params = params;
        function.return_type = return_type;
        Self {
            function,
            jumps: Vec::new(),
            label_pcs: Vec::new(),
        }
    }

    fn label_pc(&self, label: &str) -> Option<usize> {
        self.label_pcs
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, pc)| *pc)
    }

    /// Patch label jumps with their instruction indices
    fn finish(mut self, lines: &[&str]) -> Result<GotoFunction, ParseError> {
        for jump in &self.jumps {
            let target = self.label_pc(&jump.label).ok_or_else(|| {
                line_error(
                    lines,
                    jump.line_number,
                    format!("undefined label '{}'", jump.label),
                )
            })?;
            if let Some(Statement {
                instruction: Instruction::Goto { target: t, .. },
                ..
            }) = self.function.body.get_mut(jump.pc)
            {
                *t = target;
            }
        }
        Ok(self.function)
    }
}

fn line_error(lines: &[&str], line_number: usize, message: impl Into<String>) -> ParseError {
    let content = line_number
        .checked_sub(1)
        .and_then(|i| lines.get(i))
        .copied()
        .unwrap_or("");
    ParseError::new(line_number, message, content)
}

/// Parse a program from text and validate it
pub fn parse_program(content: &str) -> Result<GotoProgram, LoadError> {
    let lines: Vec<&str> = content.lines().collect();
    let mut globals = Vec::new();
    let mut functions = Vec::new();
    let mut entry = SymbolId::new("main");
    let mut current: Option<FunctionBuilder> = None;

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;
        let parsed = parse_line(line).map_err(|mut e| {
            e.line_number = line_number;
            e
        })?;
        let outside = || line_error(&lines, line_number, "outside of a function");

        match parsed {
            LineResult::Skip => {}
            LineResult::Global(var) => {
                if current.is_some() {
                    return Err(line_error(&lines, line_number, "global declared inside a function").into());
                }
                globals.push(var);
            }
            LineResult::Entry(name) => {
                if current.is_some() {
                    return Err(line_error(&lines, line_number, ".entry inside a function").into());
                }
                entry = name;
            }
            LineResult::Function {
                name,
                params,
                return_type,
            } => {
                if let Some(open) = &current {
                    return Err(line_error(
                        &lines,
                        line_number,
                        format!("missing .end for function '{}'", open.function.name),
                    )
                    .into());
                }
                current = Some(FunctionBuilder::new(name, params, return_type));
            }
            LineResult::Local(var) => {
                let b = current.as_mut().ok_or_else(outside)?;
                b.function.locals.push(var);
            }
            LineResult::Label(label) => {
                let b = current.as_mut().ok_or_else(outside)?;
                if b.label_pc(&label).is_some() {
                    return Err(line_error(&lines, line_number, format!("duplicate label '{}'", label)).into());
                }
                let pc = b.function.body.len();
                b.label_pcs.push((label.clone(), pc));
                b.function.labels.insert(pc, label);
            }
            LineResult::Instruction(instruction, target) => {
                let b = current.as_mut().ok_or_else(outside)?;
                let pc = b.function.body.len();
                let instruction = match (instruction, target) {
                    (Instruction::Goto { guard, .. }, Some(Target::Index(target))) => {
                        Instruction::Goto { guard, target }
                    }
                    (instruction, Some(Target::Label(label))) => {
                        b.jumps.push(PendingJump {
                            pc,
                            label,
                            line_number,
                        });
                        instruction
                    }
                    (instruction, _) => instruction,
                };
                b.function
                    .body
                    .push(Statement::new(instruction, Location::new(line_number)));
            }
            LineResult::End => {
                let b = current.take().ok_or_else(outside)?;
                functions.push(b.finish(&lines)?);
            }
        }
    }
    if let Some(open) = current {
        return Err(line_error(
            &lines,
            lines.len(),
            format!("function '{}' is missing .end", open.function.name),
        )
        .into());
    }
    Ok(GotoProgram::new(globals, functions, entry.as_str())?)
}

/// Read and parse a program file
pub fn parse_file(path: &Path) -> Result<GotoProgram, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_program(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_literal("42").unwrap(), 42);
        assert_eq!(parse_literal("-7").unwrap(), -7);
        assert_eq!(parse_literal("0xff").unwrap(), 255);
        assert_eq!(parse_literal("-0x10").unwrap(), -16);
        assert!(parse_literal("").is_err());
        assert!(parse_literal("12ab").is_err());
    }

    #[test]
    fn test_parse_expr_forms() {
        let e = parse_expr("(== (+ x 1) flag)").unwrap();
        assert_eq!(e.to_string(), "(== (+ x 1) flag)");
        let e = parse_expr("(+ a b c)").unwrap();
        assert_eq!(e.to_string(), "(+ (+ a b) c)");
        assert_eq!(parse_expr("(- x)").unwrap().to_string(), "(- x)");
        assert_eq!(parse_expr("(cast u8 (byte x 3))").unwrap().to_string(), "(cast u8 (byte x 3))");
        assert_eq!(parse_expr("(nondet i16)").unwrap(), Expr::Nondet(Some(Type::int(16, true))));
        assert_eq!(parse_expr("nondet").unwrap(), Expr::Nondet(None));
    }

    #[test]
    fn test_parse_expr_errors_have_columns() {
        let err = parse_expr("(+ x").unwrap_err();
        assert_eq!(err.column, Some(5));
        let err = parse_expr("(?? x y)").unwrap_err();
        assert_eq!(err.column, Some(2));
        assert!(err.message.contains("unknown operator"));
        let err = parse_expr("(< a b c)").unwrap_err();
        assert!(err.message.contains("exactly two"));
    }

    #[test]
    fn test_parse_line_skip() {
        assert_eq!(parse_line("").unwrap(), LineResult::Skip);
        assert_eq!(parse_line("   # comment").unwrap(), LineResult::Skip);
        assert_eq!(parse_line("; another").unwrap(), LineResult::Skip);
    }

    #[test]
    fn test_parse_line_instructions() {
        match parse_line("  assert (!= x 0) \"x is nonzero\" # trailing").unwrap() {
            LineResult::Instruction(Instruction::Assert { comment, .. }, None) => {
                assert_eq!(comment, "x is nonzero")
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_line("if (< i 3) goto loop").unwrap() {
            LineResult::Instruction(Instruction::Goto { guard: Some(_), .. }, Some(Target::Label(l))) => {
                assert_eq!(l, "loop")
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse_line("create worker 1 (+ n 2) -> t").unwrap() {
            LineResult::Instruction(Instruction::ThreadCreate { args, handle, .. }, None) => {
                assert_eq!(args.len(), 2);
                assert_eq!(handle, Some(SymbolId::new("t")));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse_line("lock m").unwrap(),
            LineResult::Instruction(Instruction::Lock(_), None)
        ));
    }

    #[test]
    fn test_parse_line_errors() {
        let err = parse_line("frobnicate x").unwrap_err();
        assert!(err.message.contains("unknown instruction"));
        assert_eq!(err.column, Some(1));
        let err = parse_line("assign x (+ 1 2) extra").unwrap_err();
        assert!(err.message.contains("trailing"));
        let err = parse_line(".global g i99").unwrap_err();
        assert!(err.message.contains("1..=64"));
    }

    #[test]
    fn test_parse_program_resolves_labels() {
        let src = "\
.global counter i32 0

.function main
.local i i32
    assign i 0
top:
    if (>= i 3) goto done
    assign counter (+ counter 1)
    assign i (+ i 1)
    goto top
done:
    assert (== counter 3) \"three iterations\"
.end
";
        let program = parse_program(src).unwrap();
        let main = program.function(&SymbolId::new("main")).unwrap();
        assert_eq!(main.body.len(), 6);
        assert_eq!(
            main.body[1].instruction,
            Instruction::Goto {
                guard: Some(parse_expr("(>= i 3)").unwrap()),
                target: 5
            }
        );
        assert_eq!(
            main.body[4].instruction,
            Instruction::Goto {
                guard: None,
                target: 1
            }
        );
        assert_eq!(main.body[5].location, Location::new(12));
    }

    #[test]
    fn test_program_display_parses_back() {
        let src = "\
.global m mutex
.global x i32 5
.function worker a:i32 -> i32
    lock m
    assign x (+ x a)
    unlock m
    return x
.end
.function main
.local t thread
    create worker 2 -> t
    join t
.end
";
        let program = parse_program(src).unwrap();
        let again = parse_program(&program.to_string()).unwrap();
        assert_eq!(again.to_string(), program.to_string());
    }

    #[test]
    fn test_parse_program_errors() {
        let err = parse_program(".function main\n goto nowhere\n.end\n").unwrap_err();
        match err {
            LoadError::Parse(e) => {
                assert_eq!(e.line_number, 2);
                assert!(e.message.contains("undefined label"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let err = parse_program(".function main\n assign y 1\n.end\n").unwrap_err();
        assert!(matches!(err, LoadError::Program(ProgramError::UnresolvedSymbol { .. })));
        let err = parse_program(".function main\n skip\n").unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
        let err = parse_program("skip\n").unwrap_err();
        assert!(matches!(err, LoadError::Parse(ref e) if e.line_number == 1));
    }

    #[test]
    fn test_byte_index_beyond_value_is_rejected() {
        let src = ".function main\n.local x u32\n.local seen u8\n assign seen (byte x 4294967295)\n.end\n";
        let err = parse_program(src).unwrap_err();
        assert!(matches!(err, LoadError::Program(ProgramError::TypeMismatch { .. })), "{:?}", err);
        let src = ".function main\n.local x u32\n.local seen u8\n assign seen (byte x 3)\n.end\n";
        assert!(parse_program(src).is_ok());
    }
}
