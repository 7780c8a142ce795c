//! Configuration documents rebuilt from the archive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub value: Value,
    pub timestamp: Timestamp,
}

/// Flat `path -> value` document; a later `set` for the same path replaces the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    entries: BTreeMap<String, ConfigEntry>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<String>, value: Value, timestamp: Timestamp) {
        self.entries
            .insert(path.into(), ConfigEntry { value, timestamp });
    }

    pub fn get(&self, path: &str) -> Option<&ConfigEntry> {
        self.entries.get(path)
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        self.entries.get(path).map(|entry| &entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigEntry)> {
        self.entries.iter()
    }
}
