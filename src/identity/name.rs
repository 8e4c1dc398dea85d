//! Case-preserving, case-insensitive names.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// An identifier that displays as given but compares, hashes and orders by
/// its lowercase form.
#[derive(Clone, Debug)]
pub struct FoldedName {
    display: String,
    folded: String,
}

impl FoldedName {
    pub fn new(name: impl Into<String>) -> Self {
        let display = name.into();
        let folded = display.to_lowercase();
        Self { display, folded }
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// The comparison form.
    pub fn folded(&self) -> &str {
        &self.folded
    }

    pub fn eq_str(&self, other: &str) -> bool {
        self.folded == other.to_lowercase()
    }
}

impl PartialEq for FoldedName {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for FoldedName {}

impl Hash for FoldedName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl PartialOrd for FoldedName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FoldedName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded.cmp(&other.folded)
    }
}

impl fmt::Display for FoldedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl From<&str> for FoldedName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for FoldedName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl AsRef<str> for FoldedName {
    fn as_ref(&self) -> &str {
        &self.display
    }
}

// Lets maps keyed by FoldedName be probed with an already-folded &str.
impl Borrow<str> for FoldedName {
    fn borrow(&self) -> &str {
        &self.folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    #[test]
    fn test_compares_case_insensitively() {
        let a = FoldedName::new("ZsBan");
        let b = FoldedName::new("zsban");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ZsBan");
        assert!(a.eq_str("ZSBAN"));
        assert!(FoldedName::new("alpha") < FoldedName::new("BETA"));
    }

    #[test]
    fn test_hash_agrees_with_eq() {
        let mut map = HashMap::new();
        map.insert(FoldedName::new("#Chan"), 1);
        assert_eq!(map.get(&FoldedName::new("#chan")), Some(&1));
        assert_eq!(map.get("#chan"), Some(&1));

        let set: BTreeSet<FoldedName> = ["b", "A", "a"].into_iter().map(FoldedName::from).collect();
        assert_eq!(set.len(), 2);
    }
}
