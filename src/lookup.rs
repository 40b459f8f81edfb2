// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The named-field schema that flows between pipeline steps.
//!
//! Each plan step that introduces new fields (load, apply, group) owns its own [`Lookup`];
//! downstream steps resolve field names against the nearest upstream lookup that defines them.

/// Flags describing where a key's value comes from and how it should be treated on output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyFlags(u8);

impl KeyFlags {
    pub const NONE: Self = Self(0);
    /// The value is materialized from the stored document, not computed.
    pub const DOC_SOURCE: Self = Self(0b001);
    /// The value participates in sort-key comparisons.
    pub const SORT_VALUE_SOURCE: Self = Self(0b010);
    /// The field was named in an explicit `RETURN`.
    pub const EXPLICIT_RETURN: Self = Self(0b100);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for KeyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug)]
pub struct LookupKey {
    pub name: String,
    pub flags: KeyFlags,
}

/// How [`Lookup::get_key`] should behave when a key with the requested name already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyOpenMode {
    /// Return the existing key, or create one if absent.
    CreateOrOpen,
    /// Fail (return `None`) if the key already exists.
    ExclusiveCreate,
}

/// An ordered, append-only set of named fields.
#[derive(Clone, Debug, Default)]
pub struct Lookup {
    keys: Vec<LookupKey>,
}

impl Lookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.keys.iter().position(|k| k.name == name)
    }

    pub fn key(&self, idx: usize) -> &LookupKey {
        &self.keys[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &LookupKey)> {
        self.keys.iter().enumerate()
    }

    /// Opens or creates a key according to `mode`. Returns `None` only when `mode` is
    /// [`KeyOpenMode::ExclusiveCreate`] and a key with this name is already present.
    pub fn get_key(&mut self, name: &str, flags: KeyFlags, mode: KeyOpenMode) -> Option<usize> {
        if let Some(idx) = self.find(name) {
            return match mode {
                KeyOpenMode::ExclusiveCreate => None,
                KeyOpenMode::CreateOrOpen => Some(idx),
            };
        }
        self.keys.push(LookupKey {
            name: name.to_string(),
            flags,
        });
        Some(self.keys.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_or_open_reuses_existing_key() {
        let mut lookup = Lookup::new();
        let a = lookup
            .get_key("title", KeyFlags::DOC_SOURCE, KeyOpenMode::CreateOrOpen)
            .unwrap();
        let b = lookup
            .get_key("title", KeyFlags::NONE, KeyOpenMode::CreateOrOpen)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn exclusive_create_fails_on_existing_name() {
        let mut lookup = Lookup::new();
        lookup
            .get_key("n", KeyFlags::NONE, KeyOpenMode::ExclusiveCreate)
            .unwrap();
        assert!(lookup
            .get_key("n", KeyFlags::NONE, KeyOpenMode::ExclusiveCreate)
            .is_none());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut lookup = Lookup::new();
        lookup.get_key("b", KeyFlags::NONE, KeyOpenMode::CreateOrOpen);
        lookup.get_key("a", KeyFlags::NONE, KeyOpenMode::CreateOrOpen);
        let names: Vec<_> = lookup.iter().map(|(_, k)| k.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
