//! Generic ordered map diffs
//!
//! A [`MapDiff`] records the entries of a target map that are new or changed
//! relative to a base map, plus tombstones for keys the target dropped.
//! Application removes tombstoned keys first and then inserts the added
//! entries, so a key listed in both ends up holding the added value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Difference between two string-keyed maps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDiff<V> {
    /// Entries added or changed in the target
    pub to_add: BTreeMap<String, V>,
    /// Keys present in the base but not in the target, sorted
    pub to_remove: Vec<String>,
}

impl<V> Default for MapDiff<V> {
    fn default() -> Self {
        Self {
            to_add: BTreeMap::new(),
            to_remove: Vec::new(),
        }
    }
}

impl<V: Clone + PartialEq> MapDiff<V> {
    /// Compute the diff that turns `base` into `target`
    pub fn between(base: &BTreeMap<String, V>, target: &BTreeMap<String, V>) -> Self {
        let to_add = target
            .iter()
            .filter(|(key, value)| base.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let to_remove = base
            .keys()
            .filter(|key| !target.contains_key(*key))
            .cloned()
            .collect();
        Self { to_add, to_remove }
    }

    /// Replay this diff onto `base`
    pub fn apply(&self, base: &BTreeMap<String, V>) -> BTreeMap<String, V> {
        let mut result = base.clone();
        for key in &self.to_remove {
            result.remove(key);
        }
        for (key, value) in &self.to_add {
            result.insert(key.clone(), value.clone());
        }
        result
    }
}

impl<V> MapDiff<V> {
    /// True when the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}
