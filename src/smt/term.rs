//! Backend-agnostic SMT terms over booleans and bit-vectors
//!
//! Terms are immutable and reference counted, so the heavy sharing produced
//! by symbolic execution (guards repeated across many steps) costs nothing to
//! clone. Every builder folds constants eagerly.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::smt::sort::{Sort, Value, mask, to_signed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BvUnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BvBinaryOp {
    Add,
    Sub,
    Mul,
    Udiv,
    Sdiv,
    Urem,
    Srem,
    And,
    Or,
    Xor,
    Shl,
    Lshr,
    Ashr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BvCompareOp {
    Ult,
    Ule,
    Slt,
    Sle,
}

impl BvUnaryOp {
    pub fn smtlib(&self) -> &'static str {
        match self {
            BvUnaryOp::Not => "bvnot",
            BvUnaryOp::Neg => "bvneg",
        }
    }
}

impl BvBinaryOp {
    pub fn smtlib(&self) -> &'static str {
        match self {
            BvBinaryOp::Add => "bvadd",
            BvBinaryOp::Sub => "bvsub",
            BvBinaryOp::Mul => "bvmul",
            BvBinaryOp::Udiv => "bvudiv",
            BvBinaryOp::Sdiv => "bvsdiv",
            BvBinaryOp::Urem => "bvurem",
            BvBinaryOp::Srem => "bvsrem",
            BvBinaryOp::And => "bvand",
            BvBinaryOp::Or => "bvor",
            BvBinaryOp::Xor => "bvxor",
            BvBinaryOp::Shl => "bvshl",
            BvBinaryOp::Lshr => "bvlshr",
            BvBinaryOp::Ashr => "bvashr",
        }
    }
}

impl BvCompareOp {
    pub fn smtlib(&self) -> &'static str {
        match self {
            BvCompareOp::Ult => "bvult",
            BvCompareOp::Ule => "bvule",
            BvCompareOp::Slt => "bvslt",
            BvCompareOp::Sle => "bvsle",
        }
    }
}

/// Evaluate a unary bit-vector operator on a `width`-bit value
pub fn apply_bv_unary(op: BvUnaryOp, a: u64, width: u32) -> u64 {
    let r = match op {
        BvUnaryOp::Not => !a,
        BvUnaryOp::Neg => a.wrapping_neg(),
    };
    r & mask(width)
}

/// Evaluate a binary bit-vector operator with SMT-LIB semantics, including
/// the total definitions of division and remainder by zero.
pub fn apply_bv_binary(op: BvBinaryOp, a: u64, b: u64, width: u32) -> u64 {
    let m = mask(width);
    let (a, b) = (a & m, b & m);
    let neg = |v: u64| v.wrapping_neg() & m;
    let msb = |v: u64| (v >> (width - 1)) & 1 == 1;
    let udiv = |x: u64, y: u64| if y == 0 { m } else { x / y };
    let urem = |x: u64, y: u64| if y == 0 { x } else { x % y };
    let r = match op {
        BvBinaryOp::Add => a.wrapping_add(b),
        BvBinaryOp::Sub => a.wrapping_sub(b),
        BvBinaryOp::Mul => a.wrapping_mul(b),
        BvBinaryOp::Udiv => udiv(a, b),
        BvBinaryOp::Urem => urem(a, b),
        BvBinaryOp::Sdiv => match (msb(a), msb(b)) {
            (false, false) => udiv(a, b),
            (true, false) => neg(udiv(neg(a), b)),
            (false, true) => neg(udiv(a, neg(b))),
            (true, true) => udiv(neg(a), neg(b)),
        },
        BvBinaryOp::Srem => match (msb(a), msb(b)) {
            (false, false) => urem(a, b),
            (true, false) => neg(urem(neg(a), b)),
            (false, true) => urem(a, neg(b)),
            (true, true) => neg(urem(neg(a), neg(b))),
        },
        BvBinaryOp::And => a & b,
        BvBinaryOp::Or => a | b,
        BvBinaryOp::Xor => a ^ b,
        BvBinaryOp::Shl => {
            if b >= width as u64 {
                0
            } else {
                a << b
            }
        }
        BvBinaryOp::Lshr => {
            if b >= width as u64 {
                0
            } else {
                a >> b
            }
        }
        BvBinaryOp::Ashr => {
            let s = to_signed(a, width);
            let shift = b.min(63) as u32;
            if b >= width as u64 {
                if s < 0 {
                    m
                } else {
                    0
                }
            } else {
                (s >> shift) as u64
            }
        }
    };
    r & m
}

pub fn apply_bv_compare(op: BvCompareOp, a: u64, b: u64, width: u32) -> bool {
    let m = mask(width);
    let (a, b) = (a & m, b & m);
    match op {
        BvCompareOp::Ult => a < b,
        BvCompareOp::Ule => a <= b,
        BvCompareOp::Slt => to_signed(a, width) < to_signed(b, width),
        BvCompareOp::Sle => to_signed(a, width) <= to_signed(b, width),
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub enum TermKind {
    BoolConst(bool),
    BvConst { value: u64, width: u32 },
    Symbol { name: String, sort: Sort },
    Not(Term),
    And(Vec<Term>),
    Or(Vec<Term>),
    Implies(Term, Term),
    Eq(Term, Term),
    Ite(Term, Term, Term),
    BvUnary(BvUnaryOp, Term),
    BvBinary(BvBinaryOp, Term, Term),
    BvCompare(BvCompareOp, Term, Term),
    Extract { high: u32, low: u32, arg: Term },
    ZeroExt { extra: u32, arg: Term },
    SignExt { extra: u32, arg: Term },
}

#[derive(Clone)]
pub struct Term(Arc<TermKind>);

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for Term {}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Term {
    fn mk(kind: TermKind) -> Self {
        Term(Arc::new(kind))
    }

    pub fn kind(&self) -> &TermKind {
        &self.0
    }

    /// Identity of this node, stable while the term is alive
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn bool(value: bool) -> Self {
        Self::mk(TermKind::BoolConst(value))
    }

    pub fn tt() -> Self {
        Self::bool(true)
    }

    pub fn ff() -> Self {
        Self::bool(false)
    }

    pub fn bv(value: u64, width: u32) -> Self {
        Self::mk(TermKind::BvConst {
            value: value & mask(width),
            width,
        })
    }

    pub fn symbol(name: impl Into<String>, sort: Sort) -> Self {
        Self::mk(TermKind::Symbol {
            name: name.into(),
            sort,
        })
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Bool(b) => Self::bool(b),
            Value::Bv { value, width } => Self::bv(value, width),
        }
    }

    pub fn as_bool_const(&self) -> Option<bool> {
        match self.kind() {
            TermKind::BoolConst(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bv_const(&self) -> Option<(u64, u32)> {
        match self.kind() {
            TermKind::BvConst { value, width } => Some((*value, *width)),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<Value> {
        match self.kind() {
            TermKind::BoolConst(b) => Some(Value::Bool(*b)),
            TermKind::BvConst { value, width } => Some(Value::bv(*value, *width)),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.as_value().is_some()
    }

    pub fn is_true(&self) -> bool {
        self.as_bool_const() == Some(true)
    }

    pub fn is_false(&self) -> bool {
        self.as_bool_const() == Some(false)
    }

    pub fn sort(&self) -> Sort {
        match self.kind() {
            TermKind::BoolConst(_)
            | TermKind::Not(_)
            | TermKind::And(_)
            | TermKind::Or(_)
            | TermKind::Implies(..)
            | TermKind::Eq(..)
            | TermKind::BvCompare(..) => Sort::Bool,
            TermKind::BvConst { width, .. } => Sort::BitVec(*width),
            TermKind::Symbol { sort, .. } => *sort,
            TermKind::Ite(_, t, _) => t.sort(),
            TermKind::BvUnary(_, a) | TermKind::BvBinary(_, a, _) => a.sort(),
            TermKind::Extract { high, low, .. } => Sort::BitVec(high - low + 1),
            TermKind::ZeroExt { extra, arg } | TermKind::SignExt { extra, arg } => {
                Sort::BitVec(arg.sort().width().unwrap_or(0) + extra)
            }
        }
    }

    /// Bit width of a bit-vector term (0 for booleans)
    pub fn width(&self) -> u32 {
        self.sort().width().unwrap_or(0)
    }

    pub fn not(t: Term) -> Term {
        match t.kind() {
            TermKind::BoolConst(b) => Term::bool(!b),
            TermKind::Not(inner) => inner.clone(),
            _ => Term::mk(TermKind::Not(t)),
        }
    }

    pub fn and<I: IntoIterator<Item = Term>>(terms: I) -> Term {
        let mut out: Vec<Term> = Vec::new();
        for t in terms {
            match t.kind() {
                TermKind::BoolConst(true) => {}
                TermKind::BoolConst(false) => return Term::ff(),
                TermKind::And(inner) => {
                    for i in inner {
                        if !out.contains(i) {
                            out.push(i.clone());
                        }
                    }
                }
                _ => {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
            }
        }
        match out.len() {
            0 => Term::tt(),
            1 => out.pop().unwrap_or_else(Term::tt),
            _ => Term::mk(TermKind::And(out)),
        }
    }

    pub fn or<I: IntoIterator<Item = Term>>(terms: I) -> Term {
        let mut out: Vec<Term> = Vec::new();
        for t in terms {
            match t.kind() {
                TermKind::BoolConst(false) => {}
                TermKind::BoolConst(true) => return Term::tt(),
                TermKind::Or(inner) => {
                    for i in inner {
                        if !out.contains(i) {
                            out.push(i.clone());
                        }
                    }
                }
                _ => {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
            }
        }
        match out.len() {
            0 => Term::ff(),
            1 => out.pop().unwrap_or_else(Term::ff),
            _ => Term::mk(TermKind::Or(out)),
        }
    }

    pub fn implies(a: Term, b: Term) -> Term {
        match (a.as_bool_const(), b.as_bool_const()) {
            (Some(true), _) => b,
            (Some(false), _) | (_, Some(true)) => Term::tt(),
            (_, Some(false)) => Term::not(a),
            _ if a == b => Term::tt(),
            _ => Term::mk(TermKind::Implies(a, b)),
        }
    }

    pub fn eq(a: Term, b: Term) -> Term {
        if a == b {
            return Term::tt();
        }
        if let (Some(x), Some(y)) = (a.as_value(), b.as_value()) {
            return Term::bool(x == y);
        }
        match (a.as_bool_const(), b.as_bool_const()) {
            (Some(true), _) => return b,
            (_, Some(true)) => return a,
            (Some(false), _) => return Term::not(b),
            (_, Some(false)) => return Term::not(a),
            _ => {}
        }
        Term::mk(TermKind::Eq(a, b))
    }

    pub fn ite(cond: Term, then: Term, els: Term) -> Term {
        match cond.as_bool_const() {
            Some(true) => return then,
            Some(false) => return els,
            None => {}
        }
        if then == els {
            return then;
        }
        match (then.as_bool_const(), els.as_bool_const()) {
            (Some(true), Some(false)) => return cond,
            (Some(false), Some(true)) => return Term::not(cond),
            _ => {}
        }
        Term::mk(TermKind::Ite(cond, then, els))
    }

    pub fn bv_unary(op: BvUnaryOp, a: Term) -> Term {
        if let Some((v, w)) = a.as_bv_const() {
            return Term::bv(apply_bv_unary(op, v, w), w);
        }
        Term::mk(TermKind::BvUnary(op, a))
    }

    pub fn bv_binary(op: BvBinaryOp, a: Term, b: Term) -> Term {
        if let (Some((x, w)), Some((y, _))) = (a.as_bv_const(), b.as_bv_const()) {
            return Term::bv(apply_bv_binary(op, x, y, w), w);
        }
        match (op, b.as_bv_const()) {
            (
                BvBinaryOp::Add
                | BvBinaryOp::Sub
                | BvBinaryOp::Or
                | BvBinaryOp::Xor
                | BvBinaryOp::Shl
                | BvBinaryOp::Lshr
                | BvBinaryOp::Ashr,
                Some((0, _)),
            ) => return a,
            (BvBinaryOp::Mul | BvBinaryOp::Udiv | BvBinaryOp::Sdiv, Some((1, _))) => return a,
            _ => {}
        }
        Term::mk(TermKind::BvBinary(op, a, b))
    }

    pub fn bv_compare(op: BvCompareOp, a: Term, b: Term) -> Term {
        if let (Some((x, w)), Some((y, _))) = (a.as_bv_const(), b.as_bv_const()) {
            return Term::bool(apply_bv_compare(op, x, y, w));
        }
        if a == b {
            return Term::bool(matches!(op, BvCompareOp::Ule | BvCompareOp::Sle));
        }
        Term::mk(TermKind::BvCompare(op, a, b))
    }

    pub fn extract(high: u32, low: u32, arg: Term) -> Term {
        if low == 0 && high + 1 == arg.width() {
            return arg;
        }
        if let Some((v, _)) = arg.as_bv_const() {
            return Term::bv(v >> low, high - low + 1);
        }
        Term::mk(TermKind::Extract { high, low, arg })
    }

    pub fn zero_ext(extra: u32, arg: Term) -> Term {
        if extra == 0 {
            return arg;
        }
        if let Some((v, w)) = arg.as_bv_const().filter(|(_, w)| w + extra <= 64) {
            return Term::bv(v, w + extra);
        }
        Term::mk(TermKind::ZeroExt { extra, arg })
    }

    pub fn sign_ext(extra: u32, arg: Term) -> Term {
        if extra == 0 {
            return arg;
        }
        if let Some((v, w)) = arg.as_bv_const().filter(|(_, w)| w + extra <= 64) {
            return Term::bv(to_signed(v, w) as u64, w + extra);
        }
        Term::mk(TermKind::SignExt { extra, arg })
    }

    /// Evaluate under an assignment of the free symbols. Returns `None` when
    /// a symbol has no value or the term is ill-sorted.
    pub fn eval<F>(&self, lookup: &F) -> Option<Value>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let b = |t: &Term| t.eval(lookup).and_then(|v| v.as_bool());
        let bv = |t: &Term| match t.eval(lookup)? {
            Value::Bv { value, width } => Some((value, width)),
            Value::Bool(_) => None,
        };
        Some(match self.kind() {
            TermKind::BoolConst(v) => Value::Bool(*v),
            TermKind::BvConst { value, width } => Value::bv(*value, *width),
            TermKind::Symbol { name, .. } => return lookup(name),
            TermKind::Not(a) => Value::Bool(!b(a)?),
            TermKind::And(args) => {
                for a in args {
                    if !b(a)? {
                        return Some(Value::Bool(false));
                    }
                }
                Value::Bool(true)
            }
            TermKind::Or(args) => {
                for a in args {
                    if b(a)? {
                        return Some(Value::Bool(true));
                    }
                }
                Value::Bool(false)
            }
            TermKind::Implies(x, y) => Value::Bool(!b(x)? || b(y)?),
            TermKind::Eq(x, y) => Value::Bool(x.eval(lookup)? == y.eval(lookup)?),
            TermKind::Ite(c, t, e) => {
                if b(c)? {
                    t.eval(lookup)?
                } else {
                    e.eval(lookup)?
                }
            }
            TermKind::BvUnary(op, a) => {
                let (v, w) = bv(a)?;
                Value::bv(apply_bv_unary(*op, v, w), w)
            }
            TermKind::BvBinary(op, x, y) => {
                let (v1, w) = bv(x)?;
                let (v2, _) = bv(y)?;
                Value::bv(apply_bv_binary(*op, v1, v2, w), w)
            }
            TermKind::BvCompare(op, x, y) => {
                let (v1, w) = bv(x)?;
                let (v2, _) = bv(y)?;
                Value::Bool(apply_bv_compare(*op, v1, v2, w))
            }
            TermKind::Extract { high, low, arg } => {
                let (v, _) = bv(arg)?;
                Value::bv(v >> low, high - low + 1)
            }
            TermKind::ZeroExt { extra, arg } => {
                let (v, w) = bv(arg)?;
                if w + extra > 64 {
                    return None;
                }
                Value::bv(v, w + extra)
            }
            TermKind::SignExt { extra, arg } => {
                let (v, w) = bv(arg)?;
                if w + extra > 64 {
                    return None;
                }
                Value::bv(to_signed(v, w) as u64, w + extra)
            }
        })
    }

    /// Direct children, in argument order
    pub fn children(&self) -> Vec<&Term> {
        match self.kind() {
            TermKind::BoolConst(_) | TermKind::BvConst { .. } | TermKind::Symbol { .. } => {
                Vec::new()
            }
            TermKind::Not(a)
            | TermKind::BvUnary(_, a)
            | TermKind::Extract { arg: a, .. }
            | TermKind::ZeroExt { arg: a, .. }
            | TermKind::SignExt { arg: a, .. } => vec![a],
            TermKind::And(args) | TermKind::Or(args) => args.iter().collect(),
            TermKind::Implies(a, b)
            | TermKind::Eq(a, b)
            | TermKind::BvBinary(_, a, b)
            | TermKind::BvCompare(_, a, b) => vec![a, b],
            TermKind::Ite(c, t, e) => vec![c, t, e],
        }
    }

    /// Collect the free symbols of this term into `out`
    pub fn collect_symbols(&self, out: &mut BTreeMap<String, Sort>) {
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(t) = stack.pop() {
            if !seen.insert(t.id()) {
                continue;
            }
            if let TermKind::Symbol { name, sort } = t.kind() {
                out.entry(name.clone()).or_insert(*sort);
            }
            stack.extend(t.children());
        }
    }

    pub fn symbols(&self) -> BTreeMap<String, Sort> {
        let mut out = BTreeMap::new();
        self.collect_symbols(&mut out);
        out
    }
}

/// Render a symbol name in SMT-LIB syntax, quoting it when needed
pub fn quote_symbol(name: &str) -> Cow<'_, str> {
    const EXTRA: &str = "~!@$%^&*_-+=<>.?/";
    let simple = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || EXTRA.contains(c));
    if simple {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("|{}|", name))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, head: &str, args: &[&Term]) -> fmt::Result {
            write!(f, "({}", head)?;
            for a in args {
                write!(f, " {}", a)?;
            }
            write!(f, ")")
        }

        match self.kind() {
            TermKind::BoolConst(b) => write!(f, "{}", b),
            TermKind::BvConst { value, width } => write!(f, "(_ bv{} {})", value, width),
            TermKind::Symbol { name, .. } => write!(f, "{}", quote_symbol(name)),
            TermKind::Not(a) => list(f, "not", &[a]),
            TermKind::And(args) => list(f, "and", &args.iter().collect::<Vec<_>>()),
            TermKind::Or(args) => list(f, "or", &args.iter().collect::<Vec<_>>()),
            TermKind::Implies(a, b) => list(f, "=>", &[a, b]),
            TermKind::Eq(a, b) => list(f, "=", &[a, b]),
            TermKind::Ite(c, t, e) => list(f, "ite", &[c, t, e]),
            TermKind::BvUnary(op, a) => list(f, op.smtlib(), &[a]),
            TermKind::BvBinary(op, a, b) => list(f, op.smtlib(), &[a, b]),
            TermKind::BvCompare(op, a, b) => list(f, op.smtlib(), &[a, b]),
            TermKind::Extract { high, low, arg } => {
                write!(f, "((_ extract {} {}) {})", high, low, arg)
            }
            TermKind::ZeroExt { extra, arg } => write!(f, "((_ zero_extend {}) {})", extra, arg),
            TermKind::SignExt { extra, arg } => write!(f, "((_ sign_extend {}) {})", extra, arg),
        }
    }
}
