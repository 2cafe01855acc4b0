// SPDX-License-Identifier: MIT OR Apache-2.0

//! Find holders which directly carry a node.
use std::cmp::Ordering;

use crate::holder::{Holder, HolderId, IdentityHandle};
use crate::node::{INHERITANCE_PREFIX, Node};

/// Which node keys a search matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeQuery {
    /// Nodes with exactly this key.
    Exact(String),

    /// Nodes whose key starts with this prefix.
    StartsWith(String),
}

impl NodeQuery {
    pub fn exact(key: &str) -> Self {
        Self::Exact(key.trim().to_lowercase())
    }

    pub fn starts_with(prefix: &str) -> Self {
        Self::StartsWith(prefix.trim().to_lowercase())
    }

    /// Direct members of a group.
    pub fn members_of(group: &str) -> Self {
        Self::Exact(format!("{INHERITANCE_PREFIX}{}", group.trim().to_lowercase()))
    }

    pub fn matches(&self, node: &Node) -> bool {
        match self {
            NodeQuery::Exact(key) => node.key() == key.as_str(),
            NodeQuery::StartsWith(prefix) => node.key().starts_with(prefix.as_str()),
        }
    }
}

/// A node together with the holder carrying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldNode<U> {
    pub holder: HolderId<U>,
    pub node: Node,
}

/// Collect every node matching the query, sorted by holder, then key, then contexts.
///
/// Only the holders' own nodes are looked at, inherited ones are not.
pub fn search<U, I>(holders: I, query: &NodeQuery) -> Vec<HeldNode<U>>
where
    U: IdentityHandle,
    I: IntoIterator<Item = Holder<U>>,
{
    let mut results: Vec<HeldNode<U>> = holders
        .into_iter()
        .flat_map(|holder| {
            let id = holder.id();
            holder
                .nodes()
                .iter()
                .filter(|node| query.matches(node))
                .map(|node| HeldNode {
                    holder: id.clone(),
                    node: node.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect();

    results.sort_by(compare);
    results
}

fn compare<U: Ord>(a: &HeldNode<U>, b: &HeldNode<U>) -> Ordering {
    a.holder
        .cmp(&b.holder)
        .then_with(|| a.node.key().cmp(b.node.key()))
        .then_with(|| a.node.contexts().cmp(b.node.contexts()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::context::ContextSet;
    use crate::holder::{Group, Holder, HolderId, NodeMap, PermissionHolder, User};
    use crate::node::Node;

    use super::{NodeQuery, search};

    fn holders() -> Vec<Holder<char>> {
        let mut bob = User::new('b', "default").unwrap();
        bob.nodes_mut().set(Node::new("build.place", true).unwrap());
        bob.nodes_mut()
            .set(Node::new("build.break", false).unwrap().with_context("world", "nether"));

        let mut alice = User::new('a', "admin").unwrap();
        alice.nodes_mut().set(Node::new("build.place", true).unwrap());

        let nodes: NodeMap = [Node::new("build.place", true).unwrap()].into_iter().collect();
        let builders = Group::new("builders").unwrap().with_nodes(nodes);

        vec![
            Holder::Group(Arc::new(builders)),
            Holder::User(Arc::new(bob)),
            Holder::User(Arc::new(alice)),
        ]
    }

    #[test]
    fn exact_matches_are_sorted() {
        let results = search(holders(), &NodeQuery::exact("Build.Place"));
        let found: Vec<_> = results.iter().map(|held| held.holder.clone()).collect();
        assert_eq!(
            found,
            vec![
                HolderId::User('a'),
                HolderId::User('b'),
                HolderId::Group("builders".to_string())
            ]
        );
    }

    #[test]
    fn prefix_matches() {
        let results = search(holders(), &NodeQuery::starts_with("build."));
        assert_eq!(results.len(), 4);

        let bob: Vec<_> = results
            .iter()
            .filter(|held| held.holder == HolderId::User('b'))
            .map(|held| held.node.key())
            .collect();
        assert_eq!(bob, vec!["build.break", "build.place"]);
        assert_eq!(
            results[1].node.contexts(),
            &ContextSet::new().with("world", "nether")
        );
    }

    #[test]
    fn members_of_group() {
        let results = search(holders(), &NodeQuery::members_of("admin"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].holder, HolderId::User('a'));
    }
}
