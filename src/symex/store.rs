//! SSA naming and symbolic variable bindings
//!
//! Names are built in two levels. The L1 name makes a variable unique per
//! thread and call activation (`worker::x!t1@2`); globals keep their plain
//! name. The SSA name appends a version (`worker::x!t1@2#3`) that is bumped
//! on every assignment.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::ir::{SymbolId, Type};
use crate::smt::Term;

/// Versioned name of one assignment target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SsaName {
    /// Program variable this version belongs to
    pub original: SymbolId,
    pub l1: String,
    pub version: u32,
}

impl SsaName {
    pub fn symbol(&self, ty: Type) -> Term {
        Term::symbol(self.to_string(), ty.sort())
    }
}

impl fmt::Display for SsaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.l1, self.version)
    }
}

/// L1 name of a thread-local variable
pub fn local_l1(function: &SymbolId, name: &SymbolId, tid: usize, activation: u32) -> String {
    format!("{}::{}!t{}@{}", function, name, tid, activation)
}

/// Current version of a variable
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: SsaName,
    pub ty: Type,
    /// Known constant, or the SSA symbol itself
    pub value: Term,
}

impl Binding {
    pub fn constant(&self) -> Option<&Term> {
        self.value.is_const().then_some(&self.value)
    }
}

/// Version counters for every L1 name on the current path
#[derive(Debug, Clone, Default)]
pub struct Renaming {
    versions: HashMap<String, u32>,
    nondet: u32,
}

impl Renaming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, original: &SymbolId, l1: &str) -> SsaName {
        let counter = self.versions.entry(l1.to_string()).or_insert(0);
        *counter += 1;
        SsaName {
            original: original.clone(),
            l1: l1.to_string(),
            version: *counter,
        }
    }

    /// Unconstrained symbol for `nondet` and uninitialised locals
    pub fn fresh_nondet(&mut self, ty: Type) -> Term {
        self.nondet += 1;
        Term::symbol(format!("nondet#{}", self.nondet), ty.sort())
    }

    /// Free (never assigned) version of a variable
    pub fn free(&mut self, original: &SymbolId, l1: &str, ty: Type) -> Binding {
        let name = self.next(original, l1);
        let value = name.symbol(ty);
        Binding { name, ty, value }
    }
}

/// Bindings of shared (global) variables, plus the race flags the data-race
/// check keeps beside them
#[derive(Debug, Clone, Default)]
pub struct Store {
    globals: BTreeMap<SymbolId, Binding>,
    race_flags: BTreeMap<SymbolId, Binding>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &SymbolId) -> Option<&Binding> {
        self.globals.get(name)
    }

    pub fn set(&mut self, name: SymbolId, binding: Binding) {
        self.globals.insert(name, binding);
    }

    pub fn race_flag(&self, name: &SymbolId) -> Option<&Binding> {
        self.race_flags.get(name)
    }

    pub fn set_race_flag(&mut self, name: SymbolId, binding: Binding) {
        self.race_flags.insert(name, binding);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SymbolId, &Binding)> {
        self.globals.iter()
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }
}

/// L1 name of the race flag guarding `name`
pub fn race_flag_l1(name: &SymbolId) -> String {
    format!("race!{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::Sort;

    #[test]
    fn test_versions_are_per_l1_name() {
        let mut r = Renaming::new();
        let x = SymbolId::new("x");
        let a = local_l1(&SymbolId::new("main"), &x, 0, 1);
        let b = local_l1(&SymbolId::new("main"), &x, 1, 1);
        assert_eq!(r.next(&x, &a).to_string(), "main::x!t0@1#1");
        assert_eq!(r.next(&x, &a).to_string(), "main::x!t0@1#2");
        assert_eq!(r.next(&x, &b).to_string(), "main::x!t1@1#1");
    }

    #[test]
    fn test_free_binding_is_symbolic() {
        let mut r = Renaming::new();
        let g = SymbolId::new("g");
        let b = r.free(&g, "g", Type::I32);
        assert!(b.constant().is_none());
        assert_eq!(b.value.sort(), Sort::BitVec(32));
        let n1 = r.fresh_nondet(Type::Bool);
        let n2 = r.fresh_nondet(Type::Bool);
        assert_ne!(n1, n2);
    }
}
