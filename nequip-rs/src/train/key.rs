//! Short names for fields in metric reports.

use std::collections::BTreeMap;

use crate::data::{FORCE_KEY, PER_ATOM_ENERGY_KEY, TOTAL_ENERGY_KEY};

/// Field name to report abbreviation. Fields without an entry are reported
/// under their full name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abbreviations(BTreeMap<String, String>);

impl Default for Abbreviations {
    fn default() -> Self {
        Self::empty()
            .with(FORCE_KEY, "f")
            .with(TOTAL_ENERGY_KEY, "e")
            .with(PER_ATOM_ENERGY_KEY, "Ei")
    }
}

impl Abbreviations {
    /// A table with no abbreviations
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, short: impl Into<String>) -> Self {
        self.insert(key, short);
        self
    }

    /// Add or replace an abbreviation
    pub fn insert(&mut self, key: impl Into<String>, short: impl Into<String>) {
        self.0.insert(key.into(), short.into());
    }

    /// Report name of `key`
    pub fn get<'a>(&'a self, key: &'a str) -> &'a str {
        self.0.get(key).map_or(key, String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let abbrev = Abbreviations::default();
        assert_eq!(abbrev.get("force"), "f");
        assert_eq!(abbrev.get("total_energy"), "e");
        assert_eq!(abbrev.get("atomic_energy"), "Ei");
        assert_eq!(abbrev.get("stress"), "stress");
    }

    #[test]
    fn test_override() {
        let abbrev = Abbreviations::default().with("force", "F");
        assert_eq!(abbrev.get("force"), "F");
    }
}
