// SPDX-License-Identifier: MIT OR Apache-2.0

//! Effective permission calculation.
//!
//! A holder's own nodes and the nodes of every group it inherits from are filtered by the active
//! contexts and the current time, then ranked. For each queried key the best ranked node among the
//! exact key and all wildcards above it decides the result.
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::context::ContextSet;
use crate::graph::{GroupLookup, closure};
use crate::holder::{HolderId, NodeMap, PermissionHolder};
use crate::node::{Node, Timestamp, wildcard_patterns};

/// Result of a permission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Tristate {
    True,
    False,
    /// No node decided the query.
    Undefined,
}

impl Tristate {
    pub fn as_bool(&self) -> bool {
        matches!(self, Tristate::True)
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Tristate::Undefined)
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value { Tristate::True } else { Tristate::False }
    }
}

impl From<Option<bool>> for Tristate {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Tristate::Undefined, Tristate::from)
    }
}

impl Display for Tristate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tristate::True => "true",
            Tristate::False => "false",
            Tristate::Undefined => "undefined",
        };

        write!(f, "{}", s)
    }
}

/// Position of a candidate node in the resolution order, lower ranks win.
///
/// Closer holders beat farther ones, heavier groups beat lighter ones on the same distance, nodes
/// with more context constraints beat less specific ones, and finally the order the candidates were
/// collected in decides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    distance: usize,
    weight: Reverse<i32>,
    specificity: Reverse<usize>,
    sequence: usize,
}

/// The node which decided a query and where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedNode<U> {
    pub node: Node,

    /// Holder which owns the node.
    pub origin: HolderId<U>,

    /// 0 for the holder's own nodes, 1 for direct parents and so on.
    pub distance: usize,

    pub weight: i32,

    rank: Rank,
}

/// Effective permissions of one holder under one set of active contexts.
#[derive(Clone, Debug)]
pub struct ResolvedPermissions<U> {
    best: HashMap<String, ResolvedNode<U>>,
    groups: Vec<String>,
    dependencies: Vec<HolderId<U>>,
    valid_until: Option<Timestamp>,
    truncated: bool,
}

impl<U> ResolvedPermissions<U>
where
    U: Clone,
{
    /// Decide a query.
    pub fn check(&self, key: &str) -> Tristate {
        self.check_detailed(key)
            .map_or(Tristate::Undefined, |resolved| resolved.node.value().into())
    }

    /// Decide a query and return the node which did it.
    pub fn check_detailed(&self, key: &str) -> Option<&ResolvedNode<U>> {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }

        let exact = self.best.get(&key);
        wildcard_patterns(&key)
            .filter_map(|pattern| self.best.get(&pattern))
            .chain(exact)
            .min_by_key(|resolved| resolved.rank)
    }

    /// Winning value for every key which is set somewhere in the graph, including wildcard keys.
    pub fn permissions(&self) -> BTreeMap<&str, bool> {
        self.best
            .iter()
            .map(|(key, resolved)| (key.as_str(), resolved.node.value()))
            .collect()
    }

    /// Returns `true` if the holder inherits from the group, directly or transitively.
    pub fn inherits(&self, group: &str) -> bool {
        let group = group.trim().to_lowercase();
        self.groups.iter().any(|name| *name == group)
    }

    /// Inherited groups in resolution order.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Holders whose state this result was computed from.
    pub fn dependencies(&self) -> &[HolderId<U>] {
        &self.dependencies
    }

    /// Point in time when a temporary node involved in this result expires.
    pub fn valid_until(&self) -> Option<Timestamp> {
        self.valid_until
    }

    /// The inheritance walk hit the depth limit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Compute the effective permissions of a holder.
///
/// This is a pure function of the holder, the groups reachable through `lookup`, the active
/// contexts and `now`. It never fails: unknown groups are skipped and cycles are broken by the
/// inheritance walk.
pub fn calculate<U, H, L>(
    holder: &H,
    active: &ContextSet,
    now: Timestamp,
    lookup: &L,
    max_depth: usize,
) -> ResolvedPermissions<U>
where
    U: Clone + Debug,
    H: PermissionHolder<U> + ?Sized,
    L: GroupLookup + ?Sized,
{
    let closure = closure(holder, active, now, lookup, max_depth);

    let mut calculator = Calculator {
        best: HashMap::new(),
        active,
        now,
        sequence: 0,
        valid_until: None,
    };

    calculator.collect(holder.id(), holder.nodes(), 0, holder.weight());
    for inherited in &closure.groups {
        calculator.collect(
            HolderId::Group(inherited.group.name().to_string()),
            inherited.group.nodes(),
            inherited.distance,
            inherited.weight,
        );
    }

    let mut dependencies = vec![holder.id()];
    dependencies.extend(closure.looked_up.iter().cloned().map(HolderId::Group));

    ResolvedPermissions {
        best: calculator.best,
        groups: closure
            .groups
            .iter()
            .map(|inherited| inherited.group.name().to_string())
            .collect(),
        dependencies,
        valid_until: calculator.valid_until,
        truncated: closure.truncated,
    }
}

struct Calculator<'a, U> {
    best: HashMap<String, ResolvedNode<U>>,
    active: &'a ContextSet,
    now: Timestamp,
    sequence: usize,
    valid_until: Option<Timestamp>,
}

impl<U: Clone> Calculator<'_, U> {
    fn collect(&mut self, origin: HolderId<U>, nodes: &NodeMap, distance: usize, weight: i32) {
        if let Some(expiry) = nodes.next_expiry(self.now) {
            self.valid_until = Some(self.valid_until.map_or(expiry, |until| until.min(expiry)));
        }

        for node in nodes.iter() {
            if node.has_expired(self.now) || !node.contexts().is_satisfied_by(self.active) {
                continue;
            }

            let rank = Rank {
                distance,
                weight: Reverse(weight),
                specificity: Reverse(node.specificity()),
                sequence: self.sequence,
            };
            self.sequence += 1;

            let candidate = ResolvedNode {
                node: node.clone(),
                origin: origin.clone(),
                distance,
                weight,
                rank,
            };

            self.best
                .entry(node.key().to_string())
                .and_modify(|current| {
                    if candidate.rank < current.rank {
                        *current = candidate.clone();
                    }
                })
                .or_insert_with(|| candidate.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::context::ContextSet;
    use crate::graph::GroupLookup;
    use crate::holder::{Group, HolderId, NodeMap, PermissionHolder, User};
    use crate::node::Node;

    use super::{Tristate, calculate};

    #[derive(Default)]
    struct Arena(HashMap<String, Arc<Group>>);

    impl Arena {
        fn add(&mut self, group: Group) {
            self.0.insert(group.name().to_string(), Arc::new(group));
        }
    }

    impl GroupLookup for Arena {
        fn group(&self, name: &str) -> Option<Arc<Group>> {
            self.0.get(name).cloned()
        }
    }

    fn group(name: &str, weight: i32, nodes: Vec<Node>) -> Group {
        Group::new(name)
            .unwrap()
            .with_weight(weight)
            .with_nodes(nodes.into_iter().collect::<NodeMap>())
    }

    fn node(key: &str, value: bool) -> Node {
        Node::new(key, value).unwrap()
    }

    #[test]
    fn wildcards() {
        let arena = Arena::default();
        let mut user = User::new('a', "default").unwrap();
        user.nodes_mut().set(node("a.b.*", true));

        let resolved = calculate(&user, &ContextSet::new().with("server", "x"), 0, &arena, 16);
        assert_eq!(resolved.check("a.b.c"), Tristate::True);
        assert_eq!(resolved.check("a.b.c.d"), Tristate::True);
        assert_eq!(resolved.check("x.y"), Tristate::Undefined);
        assert_eq!(resolved.check("a.b"), Tristate::Undefined);
        assert_eq!(resolved.check(""), Tristate::Undefined);
    }

    #[test]
    fn exact_and_wildcard_on_same_holder_use_insertion_order() {
        let arena = Arena::default();
        let mut user = User::new('a', "default").unwrap();
        user.nodes_mut().set(node("a.*", false));
        user.nodes_mut().set(node("a.b", true));

        let resolved = calculate(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(resolved.check("a.b"), Tristate::False);
        assert_eq!(resolved.check("a.c"), Tristate::False);
    }

    #[test]
    fn closer_holders_win() {
        let mut arena = Arena::default();
        arena.add(group("default", 0, vec![node("build", true)]));

        let mut user = User::new('a', "default").unwrap();
        let resolved = calculate(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(resolved.check("build"), Tristate::True);
        assert!(resolved.inherits("default"));

        user.nodes_mut().set(node("build", false));
        let resolved = calculate(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(resolved.check("build"), Tristate::False);
        let detailed = resolved.check_detailed("build").unwrap();
        assert_eq!(detailed.origin, HolderId::User('a'));
        assert_eq!(detailed.distance, 0);
    }

    #[test]
    fn heavier_parents_win_on_equal_distance() {
        let mut arena = Arena::default();
        arena.add(group("light", 1, vec![node("chat.color", false)]));
        arena.add(group("heavy", 10, vec![node("chat.color", true)]));

        let mut user = User::new('a', "light").unwrap();
        user.nodes_mut().set(Node::inheritance("heavy").unwrap());

        let resolved = calculate(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(resolved.check("chat.color"), Tristate::True);
        assert_eq!(
            resolved.check_detailed("chat.color").unwrap().origin,
            HolderId::Group("heavy".to_string())
        );
    }

    #[test]
    fn more_specific_contexts_win() {
        let arena = Arena::default();
        let mut user = User::new('a', "default").unwrap();
        user.nodes_mut().set(node("fly", false));
        user.nodes_mut()
            .set(node("fly", true).with_context("world", "creative"));

        let creative = ContextSet::new().with("world", "creative");
        let resolved = calculate(&user, &creative, 0, &arena, 16);
        assert_eq!(resolved.check("fly"), Tristate::True);

        let resolved = calculate(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(resolved.check("fly"), Tristate::False);
    }

    #[test]
    fn non_matching_contexts_never_apply() {
        let arena = Arena::default();
        let mut user = User::new('a', "default").unwrap();
        user.nodes_mut()
            .set(node("teleport", true).with_context("server", "lobby"));

        let resolved = calculate(&user, &ContextSet::new().with("server", "pvp"), 0, &arena, 16);
        assert_eq!(resolved.check("teleport"), Tristate::Undefined);
    }

    #[test]
    fn expired_nodes_are_ignored_and_bound_validity() {
        let arena = Arena::default();
        let mut user = User::new('a', "default").unwrap();
        user.nodes_mut().set(node("vip.kit", true).expires_at(100));

        let resolved = calculate(&user, &ContextSet::new(), 50, &arena, 16);
        assert_eq!(resolved.check("vip.kit"), Tristate::True);
        assert_eq!(resolved.valid_until(), Some(100));

        let resolved = calculate(&user, &ContextSet::new(), 100, &arena, 16);
        assert_eq!(resolved.check("vip.kit"), Tristate::Undefined);
        assert_eq!(resolved.valid_until(), None);
    }

    #[test]
    fn dependencies_include_missing_groups() {
        let arena = Arena::default();
        let user = User::new('a', "ghost").unwrap();
        let resolved = calculate(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(
            resolved.dependencies(),
            &[HolderId::User('a'), HolderId::Group("ghost".to_string())]
        );
        assert!(!resolved.inherits("ghost"));
    }

    #[test]
    fn tristate_conversions() {
        assert_eq!(Tristate::from(true), Tristate::True);
        assert_eq!(Tristate::from(None), Tristate::Undefined);
        assert!(!Tristate::Undefined.as_bool());
        assert!(Tristate::False.is_defined());
        assert_eq!(Tristate::False.to_string(), "false");
    }
}
