// SPDX-License-Identifier: MIT OR Apache-2.0

//! Context sets and the matching rules between a node's contexts and the contexts active for a
//! query.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Context key describing the server an actor is connected to.
pub const SERVER_KEY: &str = "server";

/// Context key describing the world an actor is located in.
pub const WORLD_KEY: &str = "world";

/// Stored context value which is satisfied by any active value under the same key.
pub const WILDCARD_VALUE: &str = "*";

/// Set of key/value context pairs.
///
/// A key can hold more than one value. When used on a node the set reads as "for every key, one of
/// its values", when used as the active contexts of a query it simply lists what is true right now.
///
/// Keys and values are trimmed and lower-cased on insertion, pairs with an empty key or value are
/// dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContextSet(BTreeMap<String, BTreeSet<String>>);

impl ContextSet {
    /// Empty context set. On a node this means "applies globally".
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair and return the set, handy when building sets inline.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a key/value pair. Returns `false` if the pair was already present or invalid.
    pub fn insert(&mut self, key: &str, value: &str) -> bool {
        let (Some(key), Some(value)) = (normalise(key), normalise(value)) else {
            return false;
        };

        self.0.entry(key).or_default().insert(value)
    }

    /// Remove every value stored under the given key.
    pub fn remove_key(&mut self, key: &str) -> bool {
        match normalise(key) {
            Some(key) => self.0.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        let (Some(key), Some(value)) = (normalise(key), normalise(value)) else {
            return false;
        };

        self.0
            .get(&key)
            .is_some_and(|values| values.contains(&value))
    }

    /// Values stored under a key.
    pub fn values(&self, key: &str) -> impl Iterator<Item = &str> {
        normalise(key)
            .and_then(|key| self.0.get(&key))
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    /// Iterate over all pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }

    /// Number of key/value pairs.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if these (node) contexts are satisfied by the given active contexts.
    ///
    /// Every distinct key needs at least one of its values among the active values for that key
    /// (OR within a key, AND across keys). A stored `*` value accepts any active value, including
    /// none at all.
    pub fn is_satisfied_by(&self, active: &ContextSet) -> bool {
        self.0.iter().all(|(key, values)| {
            if values.contains(WILDCARD_VALUE) {
                return true;
            }

            match active.0.get(key) {
                Some(active_values) => values.iter().any(|value| active_values.contains(value)),
                None => false,
            }
        })
    }
}

impl<K, V> FromIterator<(K, V)> for ContextSet
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = ContextSet::new();
        for (key, value) in iter {
            set.insert(key.as_ref(), value.as_ref());
        }
        set
    }
}

impl Display for ContextSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "global");
        }

        let pairs: Vec<String> = self
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        write!(f, "{}", pairs.join(", "))
    }
}

fn normalise(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextSet, SERVER_KEY, WORLD_KEY};

    #[test]
    fn empty_node_contexts_match_everything() {
        let node = ContextSet::new();
        assert!(node.is_satisfied_by(&ContextSet::new()));
        assert!(node.is_satisfied_by(&ContextSet::new().with(SERVER_KEY, "lobby")));
    }

    #[test]
    fn or_within_key_and_across_keys() {
        let node = ContextSet::new()
            .with(SERVER_KEY, "lobby")
            .with(SERVER_KEY, "survival")
            .with(WORLD_KEY, "nether");

        let active = ContextSet::new()
            .with(SERVER_KEY, "survival")
            .with(WORLD_KEY, "nether");
        assert!(node.is_satisfied_by(&active));

        // Missing world.
        let active = ContextSet::new().with(SERVER_KEY, "lobby");
        assert!(!node.is_satisfied_by(&active));

        // Wrong server.
        let active = ContextSet::new()
            .with(SERVER_KEY, "creative")
            .with(WORLD_KEY, "nether");
        assert!(!node.is_satisfied_by(&active));
    }

    #[test]
    fn wildcard_value_matches_unconditionally() {
        let node = ContextSet::new().with(SERVER_KEY, "*");
        assert!(node.is_satisfied_by(&ContextSet::new()));
        assert!(node.is_satisfied_by(&ContextSet::new().with(SERVER_KEY, "anything")));
    }

    #[test]
    fn active_contexts_may_carry_more_keys() {
        let node = ContextSet::new().with(WORLD_KEY, "end");
        let active = ContextSet::new()
            .with(WORLD_KEY, "end")
            .with(SERVER_KEY, "lobby")
            .with("gamemode", "creative");
        assert!(node.is_satisfied_by(&active));
    }

    #[test]
    fn normalisation() {
        let mut set = ContextSet::new();
        assert!(set.insert(" Server ", "LOBBY"));
        assert!(!set.insert("server", "lobby"));
        assert!(!set.insert("", "lobby"));
        assert!(!set.insert("world", "  "));

        assert!(set.contains("SERVER", "Lobby"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.to_string(), "server=lobby");
        assert_eq!(ContextSet::new().to_string(), "global");
    }

    #[test]
    fn collects_from_pairs() {
        let set: ContextSet = [("server", "a"), ("server", "b"), ("world", "c")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 3);
        assert_eq!(set.values("server").collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
