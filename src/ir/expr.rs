//! Expression language of goto programs

use std::fmt;

use crate::ir::symbol::SymbolId;
use crate::ir::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Logical negation `!`
    Not,
    /// Bitwise complement `~`
    BitNot,
    /// Arithmetic negation `-`
    Neg,
}

impl UnaryOp {
    pub fn token(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Neg => "-",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 18] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Rem,
        BinaryOp::BitAnd,
        BinaryOp::BitOr,
        BinaryOp::BitXor,
        BinaryOp::Shl,
        BinaryOp::Shr,
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::And,
        BinaryOp::Or,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.token() == token)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_shift(&self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Symbol(SymbolId),
    /// Integer literal; its type comes from the surrounding context
    Literal(i128),
    Bool(bool),
    /// Fresh unconstrained value, optionally with an explicit type
    Nondet(Option<Type>),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ite {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    Cast {
        ty: Type,
        arg: Box<Expr>,
    },
    /// Byte `index` of an integer as laid out in target memory
    Byte {
        arg: Box<Expr>,
        index: u32,
    },
}

impl Expr {
    pub fn symbol(name: impl AsRef<str>) -> Self {
        Expr::Symbol(SymbolId::new(name))
    }

    pub fn unary(op: UnaryOp, arg: Expr) -> Self {
        Expr::Unary {
            op,
            arg: Box::new(arg),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn ite(cond: Expr, then: Expr, els: Expr) -> Self {
        Expr::Ite {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        }
    }

    pub fn cast(ty: Type, arg: Expr) -> Self {
        Expr::Cast {
            ty,
            arg: Box::new(arg),
        }
    }

    /// Visit every symbol referenced by this expression, in order.
    pub fn for_each_symbol<F: FnMut(&SymbolId)>(&self, f: &mut F) {
        match self {
            Expr::Symbol(s) => f(s),
            Expr::Literal(_) | Expr::Bool(_) | Expr::Nondet(_) => {}
            Expr::Unary { arg, .. } | Expr::Cast { arg, .. } | Expr::Byte { arg, .. } => {
                arg.for_each_symbol(f)
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.for_each_symbol(f);
                rhs.for_each_symbol(f);
            }
            Expr::Ite { cond, then, els } => {
                cond.for_each_symbol(f);
                then.for_each_symbol(f);
                els.for_each_symbol(f);
            }
        }
    }

    /// Visit this expression and every subexpression, parents first.
    pub fn for_each_subexpr<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Symbol(_) | Expr::Literal(_) | Expr::Bool(_) | Expr::Nondet(_) => {}
            Expr::Unary { arg, .. } | Expr::Cast { arg, .. } | Expr::Byte { arg, .. } => {
                arg.for_each_subexpr(f)
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.for_each_subexpr(f);
                rhs.for_each_subexpr(f);
            }
            Expr::Ite { cond, then, els } => {
                cond.for_each_subexpr(f);
                then.for_each_subexpr(f);
                els.for_each_subexpr(f);
            }
        }
    }

    pub fn symbols(&self) -> Vec<SymbolId> {
        let mut out = Vec::new();
        self.for_each_symbol(&mut |s| {
            if !out.contains(s) {
                out.push(s.clone());
            }
        });
        out
    }

    /// Type carried by the expression itself, ignoring context.
    ///
    /// Literals and untyped `nondet` have no natural type; `lookup` resolves
    /// symbols.
    pub fn natural_type<F>(&self, lookup: &F) -> Option<Type>
    where
        F: Fn(&SymbolId) -> Option<Type>,
    {
        match self {
            Expr::Symbol(s) => lookup(s),
            Expr::Literal(_) => None,
            Expr::Bool(_) => Some(Type::Bool),
            Expr::Nondet(ty) => *ty,
            Expr::Unary {
                op: UnaryOp::Not, ..
            } => Some(Type::Bool),
            Expr::Unary { arg, .. } => arg.natural_type(lookup),
            Expr::Binary { op, lhs, rhs } => {
                if op.is_comparison() || op.is_logical() {
                    Some(Type::Bool)
                } else if op.is_shift() {
                    lhs.natural_type(lookup)
                } else {
                    lhs.natural_type(lookup).or_else(|| rhs.natural_type(lookup))
                }
            }
            Expr::Ite { then, els, .. } => then
                .natural_type(lookup)
                .or_else(|| els.natural_type(lookup)),
            Expr::Cast { ty, .. } => Some(*ty),
            Expr::Byte { .. } => Some(Type::Int {
                width: 8,
                signed: false,
            }),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Symbol(s) => write!(f, "{}", s),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Nondet(None) => write!(f, "nondet"),
            Expr::Nondet(Some(ty)) => write!(f, "(nondet {})", ty),
            Expr::Unary { op, arg } => write!(f, "({} {})", op.token(), arg),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", op.token(), lhs, rhs),
            Expr::Ite { cond, then, els } => write!(f, "(ite {} {} {})", cond, then, els),
            Expr::Cast { ty, arg } => write!(f, "(cast {} {})", ty, arg),
            Expr::Byte { arg, index } => write!(f, "(byte {} {})", arg, index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_prefix_form() {
        let e = Expr::binary(
            BinaryOp::Eq,
            Expr::binary(BinaryOp::Add, Expr::symbol("x"), Expr::Literal(1)),
            Expr::symbol("flag"),
        );
        assert_eq!(e.to_string(), "(== (+ x 1) flag)");
    }

    #[test]
    fn test_symbols_deduplicated_in_order() {
        let e = Expr::ite(
            Expr::symbol("c"),
            Expr::symbol("a"),
            Expr::binary(BinaryOp::Sub, Expr::symbol("a"), Expr::symbol("b")),
        );
        let names: Vec<String> = e.symbols().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_natural_type() {
        let lookup = |s: &SymbolId| {
            if s.as_str() == "x" {
                Some(Type::int(16, false))
            } else {
                None
            }
        };
        let sum = Expr::binary(BinaryOp::Add, Expr::Literal(3), Expr::symbol("x"));
        assert_eq!(sum.natural_type(&lookup), Some(Type::int(16, false)));
        assert_eq!(Expr::Literal(3).natural_type(&lookup), None);
        let cmp = Expr::binary(BinaryOp::Lt, Expr::Literal(3), Expr::symbol("x"));
        assert_eq!(cmp.natural_type(&lookup), Some(Type::Bool));
    }

    #[test]
    fn test_op_tokens_roundtrip() {
        for op in BinaryOp::ALL {
            assert_eq!(BinaryOp::from_token(op.token()), Some(op));
        }
    }
}
