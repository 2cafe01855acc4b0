// SPDX-License-Identifier: MIT OR Apache-2.0

//! Permission nodes, the atoms every holder is made of.
use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextSet;
use crate::holder::{NameError, validate_name};

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Prefix of keys which express membership in a group.
pub const INHERITANCE_PREFIX: &str = "group.";

/// Final key segment which grants everything below its parent.
pub const WILDCARD_SEGMENT: &str = "*";

#[derive(Debug, Error, PartialEq)]
pub enum NodeError {
    #[error("node key must not be empty")]
    EmptyKey,

    #[error("invalid group reference: {0}")]
    InvalidGroup(#[from] NameError),
}

/// A single permission assignment.
///
/// Nodes are immutable values. Changing a holder means replacing nodes in its node map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    key: String,
    value: bool,
    contexts: ContextSet,
    expiry: Option<Timestamp>,
}

impl Node {
    /// Create a permanent, global node.
    pub fn new(key: &str, value: bool) -> Result<Self, NodeError> {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(NodeError::EmptyKey);
        }

        Ok(Self {
            key,
            value,
            contexts: ContextSet::new(),
            expiry: None,
        })
    }

    /// Create a node which makes its holder inherit from the given group.
    pub fn inheritance(group: &str) -> Result<Self, NodeError> {
        let group = validate_name(group)?;
        Self::new(&format!("{INHERITANCE_PREFIX}{group}"), true)
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.contexts.insert(key, value);
        self
    }

    pub fn with_contexts(mut self, contexts: ContextSet) -> Self {
        self.contexts = contexts;
        self
    }

    /// Make the node temporary, it stops applying at the given time.
    pub fn expires_at(mut self, expiry: Timestamp) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_value(mut self, value: bool) -> Self {
        self.value = value;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> bool {
        self.value
    }

    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    pub fn expiry(&self) -> Option<Timestamp> {
        self.expiry
    }

    pub fn is_temporary(&self) -> bool {
        self.expiry.is_some()
    }

    /// Returns `true` if the node is temporary and its expiry is not in the future.
    pub fn has_expired(&self, now: Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    /// Name of the group this node inherits from, if it is an inheritance node.
    pub fn group_name(&self) -> Option<&str> {
        self.key
            .strip_prefix(INHERITANCE_PREFIX)
            .filter(|name| !name.is_empty())
    }

    /// Number of context constraints, more constraints rank higher.
    pub fn specificity(&self) -> usize {
        self.contexts.len()
    }

    /// Two nodes share an identity when key and contexts are equal. A holder never stores two nodes
    /// with the same identity.
    pub fn same_identity(&self, other: &Node) -> bool {
        self.key == other.key && self.contexts == other.contexts
    }

    /// Returns `true` if this node's key grants or denies the queried key, either exactly or as a
    /// wildcard above it.
    pub fn matches_key(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        self.key == query || wildcard_patterns(&query).any(|pattern| pattern == self.key)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={} ({})", self.key, self.value, self.contexts)?;
        if let Some(expiry) = self.expiry {
            write!(f, " until {expiry}")?;
        }
        Ok(())
    }
}

/// All wildcard keys which would match the given (normalised) key, most specific first.
///
/// For `a.b.c` these are `a.b.*`, `a.*` and `*`.
pub fn wildcard_patterns(key: &str) -> impl Iterator<Item = String> + '_ {
    let cuts = key.match_indices('.').map(|(index, _)| index).rev();
    cuts.map(move |index| format!("{}.{WILDCARD_SEGMENT}", &key[..index]))
        .chain(std::iter::once(WILDCARD_SEGMENT.to_string()))
        .filter(move |pattern| pattern != key)
}

#[cfg(test)]
mod tests {
    use super::{Node, NodeError, wildcard_patterns};

    #[test]
    fn rejects_empty_keys() {
        assert_eq!(Node::new("  ", true), Err(NodeError::EmptyKey));
        assert!(Node::inheritance("").is_err());
        assert!(Node::inheritance("has space").is_err());
    }

    #[test]
    fn inheritance_nodes() {
        let node = Node::inheritance("Admin").unwrap();
        assert_eq!(node.key(), "group.admin");
        assert_eq!(node.group_name(), Some("admin"));
        assert!(node.value());

        let node = Node::new("group.", true).unwrap();
        assert_eq!(node.group_name(), None);
    }

    #[test]
    fn wildcard_expansion() {
        let patterns: Vec<_> = wildcard_patterns("a.b.c").collect();
        assert_eq!(patterns, vec!["a.b.*", "a.*", "*"]);

        let patterns: Vec<_> = wildcard_patterns("single").collect();
        assert_eq!(patterns, vec!["*"]);

        let node = Node::new("a.b.*", true).unwrap();
        assert!(node.matches_key("a.b.c"));
        assert!(node.matches_key("a.b.c.d"));
        assert!(!node.matches_key("a.b"));
        assert!(!node.matches_key("x.y"));

        let node = Node::new("*", false).unwrap();
        assert!(node.matches_key("anything.at.all"));
    }

    #[test]
    fn expiry() {
        let node = Node::new("fly", true).unwrap().expires_at(100);
        assert!(node.is_temporary());
        assert!(!node.has_expired(99));
        assert!(node.has_expired(100));
        assert!(!Node::new("fly", true).unwrap().has_expired(u64::MAX));
    }

    #[test]
    fn identity_ignores_value_and_expiry() {
        let a = Node::new("build", true).unwrap().with_context("world", "nether");
        let b = a.clone().with_value(false).expires_at(10);
        let c = a.clone().with_context("server", "lobby");
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
        assert_eq!(a.specificity(), 1);
        assert_eq!(c.specificity(), 2);
    }
}
