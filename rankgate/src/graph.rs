// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inheritance graph traversal.
//!
//! Groups live in an arena indexed by name and holders point at them through inheritance nodes.
//! Nothing stops an administrator from making a group inherit (transitively) from itself, so every
//! traversal keeps a visited set and a depth limit instead of following links recursively.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use tracing::{trace, warn};

use crate::context::ContextSet;
use crate::holder::{Group, HolderId, PermissionHolder};
use crate::node::Timestamp;

/// Default limit for how many levels of parents are followed.
pub const DEFAULT_MAX_DEPTH: usize = 16;

/// Read access to the group arena.
pub trait GroupLookup {
    fn group(&self, name: &str) -> Option<Arc<Group>>;
}

/// A group reached while walking up from a holder.
#[derive(Clone, Debug)]
pub struct InheritedGroup {
    pub group: Arc<Group>,

    /// Number of inheritance links between the holder and this group, direct parents are 1.
    pub distance: usize,

    pub weight: i32,
}

/// Result of walking the inheritance graph of one holder.
#[derive(Clone, Debug, Default)]
pub struct Closure {
    /// Reachable groups, ordered by distance, then weight (descending), then name.
    pub groups: Vec<InheritedGroup>,

    /// Every group name the walk asked the arena for, including ones which did not exist.
    pub looked_up: Vec<String>,

    /// The walk stopped at the depth limit while parents were still left to visit.
    pub truncated: bool,
}

impl Closure {
    pub fn contains(&self, name: &str) -> bool {
        self.groups.iter().any(|inherited| inherited.group.name() == name)
    }
}

/// Walk all parents of a holder breadth-first.
///
/// Only inheritance nodes which are set to `true`, not expired and satisfied by the active contexts
/// are followed. A group is visited once, at the shortest distance it can be reached by, which breaks
/// cycles and collapses diamonds. Parents which do not exist are skipped.
pub fn closure<U, H, L>(
    holder: &H,
    active: &ContextSet,
    now: Timestamp,
    lookup: &L,
    max_depth: usize,
) -> Closure
where
    U: std::fmt::Debug,
    H: PermissionHolder<U> + ?Sized,
    L: GroupLookup + ?Sized,
{
    let mut result = Closure::default();
    let mut visited: HashSet<String> = HashSet::new();

    if let HolderId::Group(name) = holder.id() {
        visited.insert(name);
    }

    let mut frontier: VecDeque<String> = VecDeque::new();
    for parent in holder.nodes().parents(active, now) {
        if visited.insert(parent.to_string()) {
            frontier.push_back(parent.to_string());
        }
    }

    let mut distance = 1;
    while !frontier.is_empty() {
        if distance > max_depth {
            result.truncated = true;
            warn!(
                holder = ?holder.id(),
                max_depth,
                remaining = frontier.len(),
                "inheritance depth limit reached, ignoring deeper parents"
            );
            break;
        }

        let mut level: Vec<Arc<Group>> = Vec::with_capacity(frontier.len());
        for name in frontier.drain(..) {
            match lookup.group(&name) {
                Some(group) => level.push(group),
                None => trace!(group = %name, "skipping unknown parent group"),
            }
            result.looked_up.push(name);
        }

        level.sort_by(|a, b| {
            b.weight()
                .cmp(&a.weight())
                .then_with(|| a.name().cmp(b.name()))
        });

        for group in level {
            for parent in group.nodes().parents(active, now) {
                if visited.insert(parent.to_string()) {
                    frontier.push_back(parent.to_string());
                }
            }

            result.groups.push(InheritedGroup {
                weight: group.weight(),
                group,
                distance,
            });
        }

        distance += 1;
    }

    result
}

/// Find every set of groups which inherit from each other in a loop.
///
/// All `true` inheritance nodes are treated as links regardless of their contexts or expiry, so this
/// reports cycles which could occur under some combination of contexts. Each returned cycle is
/// sorted by name and the list is sorted as well.
pub fn inheritance_cycles<'a>(groups: impl IntoIterator<Item = &'a Group>) -> Vec<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    let mut self_loops: HashSet<&str> = HashSet::new();

    for group in groups {
        graph.add_node(group.name());
        for node in group.nodes().iter().filter(|node| node.value()) {
            if let Some(parent) = node.group_name() {
                if parent == group.name() {
                    self_loops.insert(group.name());
                }
                graph.add_edge(group.name(), parent, ());
            }
        }
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || component.iter().any(|name| self_loops.contains(name))
        })
        .map(|component| {
            let mut names: Vec<String> = component.into_iter().map(str::to_string).collect();
            names.sort();
            names
        })
        .collect();

    cycles.sort();
    cycles
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::context::ContextSet;
    use crate::holder::{Group, NodeMap, User};
    use crate::node::Node;

    use super::{GroupLookup, closure, inheritance_cycles};

    #[derive(Default)]
    struct Arena(HashMap<String, Arc<Group>>);

    impl Arena {
        fn add(&mut self, name: &str, weight: i32, parents: &[&str]) {
            let nodes: NodeMap = parents
                .iter()
                .map(|parent| Node::inheritance(parent).unwrap())
                .collect();
            let group = Group::new(name)
                .unwrap()
                .with_weight(weight)
                .with_nodes(nodes);
            self.0.insert(name.to_string(), Arc::new(group));
        }
    }

    impl GroupLookup for Arena {
        fn group(&self, name: &str) -> Option<Arc<Group>> {
            self.0.get(name).cloned()
        }
    }

    fn names(closure: &super::Closure) -> Vec<(String, usize)> {
        closure
            .groups
            .iter()
            .map(|inherited| (inherited.group.name().to_string(), inherited.distance))
            .collect()
    }

    #[test]
    fn breadth_first_weight_ordered() {
        let mut arena = Arena::default();
        arena.add("default", 0, &[]);
        arena.add("builder", 10, &["default"]);
        arena.add("moderator", 50, &["default"]);

        let mut user = User::new('a', "builder").unwrap();
        crate::holder::PermissionHolder::nodes_mut(&mut user)
            .set(Node::inheritance("moderator").unwrap());

        let result = closure(&user, &ContextSet::new(), 0, &arena, 16);
        assert_eq!(
            names(&result),
            vec![
                ("moderator".to_string(), 1),
                ("builder".to_string(), 1),
                ("default".to_string(), 2),
            ]
        );
        assert!(!result.truncated);
    }

    #[test]
    fn cycles_terminate() {
        let mut arena = Arena::default();
        arena.add("a", 0, &["b"]);
        arena.add("b", 0, &["c"]);
        arena.add("c", 0, &["a"]);

        let group = arena.group("a").unwrap();
        let result = closure::<char, _, _>(group.as_ref(), &ContextSet::new(), 0, &arena, 16);
        assert_eq!(
            names(&result),
            vec![("b".to_string(), 1), ("c".to_string(), 2)]
        );
    }

    #[test]
    fn diamonds_visit_shared_ancestor_once() {
        let mut arena = Arena::default();
        arena.add("root", 0, &[]);
        arena.add("left", 0, &["root"]);
        arena.add("right", 0, &["root"]);
        arena.add("bottom", 0, &["left", "right"]);

        let group = arena.group("bottom").unwrap();
        let result = closure::<char, _, _>(group.as_ref(), &ContextSet::new(), 0, &arena, 16);
        assert_eq!(
            names(&result),
            vec![
                ("left".to_string(), 1),
                ("right".to_string(), 1),
                ("root".to_string(), 2),
            ]
        );
    }

    #[test]
    fn depth_limit_truncates() {
        let mut arena = Arena::default();
        arena.add("g0", 0, &["g1"]);
        arena.add("g1", 0, &["g2"]);
        arena.add("g2", 0, &["g3"]);
        arena.add("g3", 0, &[]);

        let group = arena.group("g0").unwrap();
        let result = closure::<char, _, _>(group.as_ref(), &ContextSet::new(), 0, &arena, 2);
        assert_eq!(names(&result), vec![("g1".to_string(), 1), ("g2".to_string(), 2)]);
        assert!(result.truncated);
    }

    #[test]
    fn missing_parents_are_looked_up_but_skipped() {
        let arena = Arena::default();
        let user = User::new('a', "ghost").unwrap();

        let result = closure(&user, &ContextSet::new(), 0, &arena, 16);
        assert!(result.groups.is_empty());
        assert_eq!(result.looked_up, vec!["ghost".to_string()]);
    }

    #[test]
    fn reports_cycles() {
        let mut arena = Arena::default();
        arena.add("a", 0, &["b"]);
        arena.add("b", 0, &["a"]);
        arena.add("c", 0, &["c"]);
        arena.add("d", 0, &["a"]);

        let cycles = inheritance_cycles(arena.0.values().map(Arc::as_ref));
        assert_eq!(
            cycles,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }
}
