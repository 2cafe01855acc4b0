// SPDX-License-Identifier: MIT OR Apache-2.0

//! Users and groups: everything which can hold permission nodes.
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextSet;
use crate::node::{Node, NodeError, Timestamp};

/// Longest accepted group or track name.
pub const MAX_NAME_LENGTH: usize = 36;

/// Identifier of a user, for example a UUID or a public key.
pub trait IdentityHandle:
    Copy + Debug + Display + Eq + Hash + Ord + Send + Sync + 'static
{
}

impl IdentityHandle for u64 {}

impl IdentityHandle for u128 {}

#[derive(Debug, Error, PartialEq)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,

    #[error("name is longer than {MAX_NAME_LENGTH} characters: {0}")]
    TooLong(String),

    #[error("name contains characters other than a-z, 0-9, '-' and '_': {0}")]
    InvalidCharacters(String),
}

/// Normalise and validate a group or track name.
pub fn validate_name(name: &str) -> Result<String, NameError> {
    let name = name.trim().to_lowercase();

    if name.is_empty() {
        return Err(NameError::Empty);
    }

    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong(name));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(NameError::InvalidCharacters(name));
    }

    Ok(name)
}

/// Identity of a permission holder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HolderId<U> {
    User(U),
    Group(String),
}

impl<U> HolderId<U> {
    pub fn is_user(&self) -> bool {
        matches!(self, HolderId::User(_))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, HolderId::Group(_))
    }
}

impl<U: Display> Display for HolderId<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HolderId::User(id) => write!(f, "user:{id}"),
            HolderId::Group(name) => write!(f, "group:{name}"),
        }
    }
}

/// Outcome of changing a node map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutateResult {
    /// The change was applied.
    Success,

    /// An identical node is already present, nothing changed.
    AlreadyHas,

    /// There was no node to remove, nothing changed.
    LacksNode,
}

impl MutateResult {
    pub fn was_successful(&self) -> bool {
        matches!(self, MutateResult::Success)
    }
}

/// Insertion-ordered collection of nodes where every node identity occurs at most once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeMap(Vec<Node>);

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node with the same identity (key and contexts) as the given one.
    pub fn get(&self, key: &str, contexts: &ContextSet) -> Option<&Node> {
        let key = key.trim().to_lowercase();
        self.0
            .iter()
            .find(|node| node.key() == key && node.contexts() == contexts)
    }

    /// Insert a node, replacing one with the same identity in place.
    pub fn set(&mut self, node: Node) -> MutateResult {
        match self.0.iter_mut().find(|stored| stored.same_identity(&node)) {
            Some(stored) if *stored == node => MutateResult::AlreadyHas,
            Some(stored) => {
                *stored = node;
                MutateResult::Success
            }
            None => {
                self.0.push(node);
                MutateResult::Success
            }
        }
    }

    /// Remove the node with the given identity.
    pub fn unset(&mut self, key: &str, contexts: &ContextSet) -> MutateResult {
        let key = key.trim().to_lowercase();
        let before = self.0.len();
        self.0
            .retain(|node| !(node.key() == key && node.contexts() == contexts));

        if self.0.len() < before {
            MutateResult::Success
        } else {
            MutateResult::LacksNode
        }
    }

    /// Remove every expired node and return them.
    pub fn prune_expired(&mut self, now: Timestamp) -> Vec<Node> {
        let (expired, kept): (Vec<Node>, Vec<Node>) = std::mem::take(&mut self.0)
            .into_iter()
            .partition(|node| node.has_expired(now));
        self.0 = kept;
        expired
    }

    /// Inheritance nodes which are set to `true` with exactly the given contexts.
    pub fn inheritance_in_contexts<'a>(
        &'a self,
        contexts: &'a ContextSet,
    ) -> impl Iterator<Item = &'a Node> {
        self.0
            .iter()
            .filter(move |node| node.value() && node.contexts() == contexts)
            .filter(|node| node.group_name().is_some())
    }

    /// Names of the groups these nodes currently inherit from under the active contexts.
    pub fn parents<'a>(
        &'a self,
        active: &'a ContextSet,
        now: Timestamp,
    ) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |node| {
                node.value() && !node.has_expired(now) && node.contexts().is_satisfied_by(active)
            })
            .filter_map(Node::group_name)
    }

    /// Earliest expiry in the future, used to bound how long a resolution stays valid.
    pub fn next_expiry(&self, now: Timestamp) -> Option<Timestamp> {
        self.0
            .iter()
            .filter_map(Node::expiry)
            .filter(|expiry| *expiry > now)
            .min()
    }
}

impl FromIterator<Node> for NodeMap {
    fn from_iter<T: IntoIterator<Item = Node>>(iter: T) -> Self {
        let mut map = NodeMap::new();
        for node in iter {
            map.set(node);
        }
        map
    }
}

/// Interface shared by users and groups.
pub trait PermissionHolder<U> {
    fn id(&self) -> HolderId<U>;

    fn nodes(&self) -> &NodeMap;

    fn nodes_mut(&mut self) -> &mut NodeMap;

    /// Priority when this holder is inherited, higher wins.
    fn weight(&self) -> i32 {
        0
    }
}

/// A group, referenced by name from inheritance nodes and tracks.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Group {
    name: String,
    weight: i32,
    nodes: NodeMap,
}

impl Group {
    pub fn new(name: &str) -> Result<Self, NameError> {
        Ok(Self {
            name: validate_name(name)?,
            weight: 0,
            nodes: NodeMap::new(),
        })
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_nodes(mut self, nodes: NodeMap) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> i32 {
        self.weight
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut NodeMap {
        &mut self.nodes
    }

    pub fn set_weight(&mut self, weight: i32) {
        self.weight = weight;
    }
}

impl<U> PermissionHolder<U> for Group {
    fn id(&self) -> HolderId<U> {
        HolderId::Group(self.name.clone())
    }

    fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    fn nodes_mut(&mut self) -> &mut NodeMap {
        &mut self.nodes
    }

    fn weight(&self) -> i32 {
        self.weight
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct User<U> {
    id: U,
    username: Option<String>,
    primary_group: String,
    nodes: NodeMap,
}

impl<U: IdentityHandle> User<U> {
    /// Create a user which is a member of the given primary group.
    pub fn new(id: U, primary_group: &str) -> Result<Self, NodeError> {
        let primary_group = validate_name(primary_group)?;
        let mut nodes = NodeMap::new();
        nodes.set(Node::inheritance(&primary_group)?);

        Ok(Self {
            id,
            username: None,
            primary_group,
            nodes,
        })
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn user_id(&self) -> U {
        self.id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn primary_group(&self) -> &str {
        &self.primary_group
    }

    pub fn set_primary_group(&mut self, group: &str) -> Result<(), NameError> {
        self.primary_group = validate_name(group)?;
        Ok(())
    }

    /// Set a primary group whose name was already validated.
    pub(crate) fn replace_primary_group(&mut self, group: &str) {
        self.primary_group = group.to_string();
    }
}

impl<U: IdentityHandle> PermissionHolder<U> for User<U> {
    fn id(&self) -> HolderId<U> {
        HolderId::User(self.id)
    }

    fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    fn nodes_mut(&mut self) -> &mut NodeMap {
        &mut self.nodes
    }
}

/// Snapshot of either kind of holder.
#[derive(Clone, Debug)]
pub enum Holder<U> {
    User(Arc<User<U>>),
    Group(Arc<Group>),
}

impl<U: IdentityHandle> Holder<U> {
    pub fn id(&self) -> HolderId<U> {
        match self {
            Holder::User(user) => user.id(),
            Holder::Group(group) => PermissionHolder::<U>::id(group.as_ref()),
        }
    }

    pub fn nodes(&self) -> &NodeMap {
        match self {
            Holder::User(user) => PermissionHolder::<U>::nodes(user.as_ref()),
            Holder::Group(group) => PermissionHolder::<U>::nodes(group.as_ref()),
        }
    }

    pub fn weight(&self) -> i32 {
        match self {
            Holder::User(_) => 0,
            Holder::Group(group) => group.weight,
        }
    }
}
