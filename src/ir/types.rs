//! Core types for the goto-program representation

use std::fmt;
use std::str::FromStr;

use crate::smt::Sort;

/// Width in bits of a thread handle.
pub const THREAD_HANDLE_WIDTH: u32 = 32;

/// Variable types known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    /// Two's-complement integer of 1..=64 bits
    Int { width: u32, signed: bool },
    /// Lock flag, true while held
    Mutex,
    /// Handle returned by `create`
    Thread,
}

impl Type {
    pub const I32: Type = Type::Int {
        width: 32,
        signed: true,
    };

    pub fn int(width: u32, signed: bool) -> Self {
        Type::Int { width, signed }
    }

    /// Solver sort used to encode values of this type
    pub fn sort(&self) -> Sort {
        match self {
            Type::Bool | Type::Mutex => Sort::Bool,
            Type::Int { width, .. } => Sort::BitVec(*width),
            Type::Thread => Sort::BitVec(THREAD_HANDLE_WIDTH),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int { .. } | Type::Thread)
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Type::Bool | Type::Mutex)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Type::Int { signed: true, .. })
    }

    /// Bit width for integer-like types
    pub fn width(&self) -> Option<u32> {
        match self {
            Type::Int { width, .. } => Some(*width),
            Type::Thread => Some(THREAD_HANDLE_WIDTH),
            Type::Bool | Type::Mutex => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int { width, signed: true } => write!(f, "i{}", width),
            Type::Int {
                width,
                signed: false,
            } => write!(f, "u{}", width),
            Type::Mutex => write!(f, "mutex"),
            Type::Thread => write!(f, "thread"),
        }
    }
}

impl FromStr for Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => return Ok(Type::Bool),
            "mutex" => return Ok(Type::Mutex),
            "thread" => return Ok(Type::Thread),
            _ => {}
        }
        let (signed, digits) = if let Some(rest) = s.strip_prefix('i') {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix('u') {
            (false, rest)
        } else {
            return Err(format!("unknown type: {}", s));
        };
        let width: u32 = digits
            .parse()
            .map_err(|_| format!("unknown type: {}", s))?;
        if !(1..=64).contains(&width) {
            return Err(format!("integer width must be 1..=64, got {}", width));
        }
        Ok(Type::Int { width, signed })
    }
}

/// Byte order of the modelled target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => write!(f, "little-endian"),
            Endianness::Big => write!(f, "big-endian"),
        }
    }
}

impl FromStr for Endianness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "little" | "little-endian" | "le" => Ok(Endianness::Little),
            "big" | "big-endian" | "be" => Ok(Endianness::Big),
            _ => Err(format!("unknown endianness: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parse_roundtrip() {
        for name in ["bool", "mutex", "thread", "i32", "u8", "i64", "u1"] {
            let ty: Type = name.parse().unwrap();
            assert_eq!(ty.to_string(), name);
        }
    }

    #[test]
    fn test_type_parse_rejects_bad_width() {
        assert!("i0".parse::<Type>().is_err());
        assert!("u65".parse::<Type>().is_err());
        assert!("float".parse::<Type>().is_err());
    }

    #[test]
    fn test_sorts() {
        assert_eq!(Type::I32.sort(), Sort::BitVec(32));
        assert_eq!(Type::Mutex.sort(), Sort::Bool);
        assert_eq!(Type::Thread.sort(), Sort::BitVec(THREAD_HANDLE_WIDTH));
    }
}
