//! Interned string table for callsite serialization.
//!
//! Frame names and file paths are interned to fixed-width ids so callsite
//! records serialize to a compact, byte-comparable form. The table lives
//! under the tracker's mutex alongside the tables that reference it and is
//! never pruned mid-run.

use std::collections::HashMap;

/// Id of an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringId(pub u32);

/// Append-only string interner.
pub struct Interner {
    lookup: HashMap<String, StringId>,
    strings: Vec<String>,
}

impl Interner {
    /// Create an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lookup: HashMap::new(),
            strings: Vec::new(),
        }
    }

    /// Intern `s`, returning its stable id.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), id);
        id
    }

    /// Resolve an id back to its string. Fatal for ids this table never
    /// issued, since those can only come from corrupted records.
    #[must_use]
    pub fn resolve(&self, id: StringId) -> &str {
        &self.strings[id.0 as usize]
    }

    /// Number of distinct strings interned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// True when nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}
