use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Where the current value of a key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Taken verbatim from the manifest.
    Declared,
    /// Seeded from a previously written output env file.
    Inherited,
    Generated,
    Prompted,
    Expanded,
    HookInjected,
}

impl Origin {
    /// Origins whose values must not be re-expanded or overwritten by hooks.
    pub fn is_protected(self) -> bool {
        matches!(self, Self::Inherited | Self::Generated | Self::Prompted)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Declared => "declared",
            Self::Inherited => "inherited",
            Self::Generated => "generated",
            Self::Prompted => "prompted",
            Self::Expanded => "expanded",
            Self::HookInjected => "hook-injected",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub origin: Origin,
}

/// Ordered key/value map with a per-key origin tag.
///
/// Keys keep the position of their first insertion.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`, returning the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        origin: Origin,
    ) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some(&i) = self.index.get(&key) {
            let entry = &mut self.entries[i];
            entry.origin = origin;
            return Some(std::mem::replace(&mut entry.value, value));
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(Entry { key, value, origin });
        None
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entry(key).map(|e| e.value.as_str())
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn origin(&self, key: &str) -> Option<Origin> {
        self.entry(key).map(|e| e.origin)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Key/value view, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Environment {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
