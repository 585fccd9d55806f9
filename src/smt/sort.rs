//! SMT sorts and concrete values

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sort {
    Bool,
    BitVec(u32),
}

impl Sort {
    pub fn width(&self) -> Option<u32> {
        match self {
            Sort::Bool => None,
            Sort::BitVec(w) => Some(*w),
        }
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sort::Bool => write!(f, "Bool"),
            Sort::BitVec(w) => write!(f, "(_ BitVec {})", w),
        }
    }
}

/// Mask covering the low `width` bits
pub fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Reinterpret the low `width` bits of `value` as a signed integer
pub fn to_signed(value: u64, width: u32) -> i64 {
    if width >= 64 {
        return value as i64;
    }
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

/// Concrete value of a term, as found in a witness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Bool(bool),
    Bv { value: u64, width: u32 },
}

impl Value {
    pub fn bv(value: u64, width: u32) -> Self {
        Value::Bv {
            value: value & mask(width),
            width,
        }
    }

    pub fn sort(&self) -> Sort {
        match self {
            Value::Bool(_) => Sort::Bool,
            Value::Bv { width, .. } => Sort::BitVec(*width),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Bv { .. } => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bv { value, .. } => Some(*value),
            Value::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bv { value, width } => Some(to_signed(*value, *width)),
            Value::Bool(_) => None,
        }
    }

    /// Default value of a sort (false / zero)
    pub fn zero(sort: Sort) -> Self {
        match sort {
            Sort::Bool => Value::Bool(false),
            Sort::BitVec(w) => Value::bv(0, w),
        }
    }

    /// Binary digits grouped in bytes, most significant first
    pub fn bit_string(&self) -> String {
        match self {
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Bv { value, width } => {
                let mut out = String::with_capacity(*width as usize + *width as usize / 8);
                for i in (0..*width).rev() {
                    out.push(if (value >> i) & 1 == 1 { '1' } else { '0' });
                    if i % 8 == 0 && i != 0 {
                        out.push(' ');
                    }
                }
                out
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Bv { value, .. } => write!(f, "{}", value),
        }
    }
}
