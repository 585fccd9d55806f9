//! Interned symbol identifiers

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Name of a function, variable, or scope.
///
/// Cloning is a reference-count bump; two identifiers compare equal when
/// their text is equal, whether or not they came from the same interner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(Arc<str>);

impl SymbolId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SymbolId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for SymbolId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_lookup_by_str() {
        let mut map = BTreeMap::new();
        map.insert(SymbolId::new("main"), 1);
        assert_eq!(map.get("main"), Some(&1));
    }
}
