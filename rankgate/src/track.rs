// SPDX-License-Identifier: MIT OR Apache-2.0

//! Promotion tracks.
//!
//! A track is an ordered list of groups, index 0 being the lowest rank. Promoting a user moves their
//! membership one group up the track, demoting moves it one group down. All expected outcomes
//! (ambiguity, not being on the track, a track pointing at deleted groups, ...) are returned as result
//! variants.
use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::ContextSet;
use crate::holder::{IdentityHandle, NameError, PermissionHolder, User, validate_name};
use crate::node::{INHERITANCE_PREFIX, Node, Timestamp};

/// An ordered, duplicate-free list of group names.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Track {
    name: String,
    groups: Vec<String>,
}

/// Outcome of changing the group list of a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackMutation {
    Success,
    AlreadyContains,
    NotContained,
    GroupNotFound,
    IndexOutOfBounds { index: usize, len: usize },
}

impl TrackMutation {
    pub fn was_successful(&self) -> bool {
        matches!(self, TrackMutation::Success)
    }
}

impl Track {
    pub fn new(name: &str) -> Result<Self, NameError> {
        Ok(Self {
            name: validate_name(name)?,
            groups: Vec::new(),
        })
    }

    /// Create a track with the given groups, duplicates are skipped.
    pub fn with_groups<'a>(
        name: &str,
        groups: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, NameError> {
        let mut track = Self::new(name)?;
        for group in groups {
            let group = validate_name(group)?;
            if !track.groups.contains(&group) {
                track.groups.push(group);
            }
        }
        Ok(track)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, group: &str) -> bool {
        self.position(group).is_some()
    }

    pub fn position(&self, group: &str) -> Option<usize> {
        let group = group.trim().to_lowercase();
        self.groups.iter().position(|name| *name == group)
    }

    /// Group following the given one, `None` at the top or if the group is not on the track.
    pub fn next(&self, group: &str) -> Option<&str> {
        let index = self.position(group)?;
        self.groups.get(index + 1).map(String::as_str)
    }

    /// Group preceding the given one, `None` at the bottom or if the group is not on the track.
    pub fn previous(&self, group: &str) -> Option<&str> {
        let index = self.position(group)?;
        index
            .checked_sub(1)
            .and_then(|index| self.groups.get(index))
            .map(String::as_str)
    }

    /// Groups on this track for which `exists` returns `false`.
    pub fn malformed_groups(&self, exists: impl Fn(&str) -> bool) -> Vec<String> {
        self.groups
            .iter()
            .filter(|group| !exists(group))
            .cloned()
            .collect()
    }

    pub(crate) fn append(&mut self, group: &str) -> TrackMutation {
        if self.contains(group) {
            return TrackMutation::AlreadyContains;
        }

        self.groups.push(group.to_string());
        TrackMutation::Success
    }

    pub(crate) fn insert(&mut self, group: &str, index: usize) -> TrackMutation {
        if self.contains(group) {
            return TrackMutation::AlreadyContains;
        }

        if index > self.groups.len() {
            return TrackMutation::IndexOutOfBounds {
                index,
                len: self.groups.len(),
            };
        }

        self.groups.insert(index, group.to_string());
        TrackMutation::Success
    }

    pub(crate) fn remove(&mut self, group: &str) -> TrackMutation {
        match self.position(group) {
            Some(index) => {
                self.groups.remove(index);
                TrackMutation::Success
            }
            None => TrackMutation::NotContained,
        }
    }

    pub(crate) fn clear(&mut self) -> TrackMutation {
        self.groups.clear();
        TrackMutation::Success
    }

    /// Track groups the user is a member of with exactly the given contexts. Expired memberships
    /// do not count, even before they are pruned.
    fn current_groups<U: IdentityHandle>(
        &self,
        user: &User<U>,
        contexts: &ContextSet,
        now: Timestamp,
    ) -> Vec<String> {
        let mut current: Vec<String> = Vec::new();
        for node in user
            .nodes()
            .inheritance_in_contexts(contexts)
            .filter(|node| !node.has_expired(now))
        {
            if let Some(group) = node.group_name() {
                if self.contains(group) && !current.iter().any(|known| known == group) {
                    current.push(group.to_string());
                }
            }
        }
        current
    }
}

impl Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.groups.join(" -> "))
    }
}

/// Outcome of promoting a user along a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromotionResult {
    /// The user moved from one group to the next.
    Success { group_from: String, group_to: String },

    /// The user was on no group of the track and got added to the first one.
    AddedToFirstGroup { group_to: String },

    /// The user is on no group of the track.
    NotOnTrack,

    /// The user is on more than one group of the track, the starting point is unclear.
    AmbiguousCall,

    /// The group filter rejected the target group.
    UndefinedFailure,

    /// The track references a group which does not exist.
    MalformedTrack { group_to: String },

    /// The user is already on the last group of the track.
    NotApplicable,
}

impl PromotionResult {
    pub fn group_from(&self) -> Option<&str> {
        match self {
            PromotionResult::Success { group_from, .. } => Some(group_from),
            _ => None,
        }
    }

    pub fn group_to(&self) -> Option<&str> {
        match self {
            PromotionResult::Success { group_to, .. }
            | PromotionResult::AddedToFirstGroup { group_to }
            | PromotionResult::MalformedTrack { group_to } => Some(group_to),
            _ => None,
        }
    }

    /// Returns `true` if the user's memberships were changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            PromotionResult::Success { .. } | PromotionResult::AddedToFirstGroup { .. }
        )
    }
}

/// Outcome of demoting a user along a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DemotionResult {
    /// The user moved from one group to the previous one.
    Success { group_from: String, group_to: String },

    /// The user was on the first group of the track. `group_from` is set when the membership was
    /// actually removed.
    RemovedFromFirstGroup { group_from: Option<String> },

    NotOnTrack,

    AmbiguousCall,

    UndefinedFailure,

    MalformedTrack { group_to: String },
}

impl DemotionResult {
    pub fn group_from(&self) -> Option<&str> {
        match self {
            DemotionResult::Success { group_from, .. } => Some(group_from),
            DemotionResult::RemovedFromFirstGroup { group_from } => group_from.as_deref(),
            _ => None,
        }
    }

    pub fn group_to(&self) -> Option<&str> {
        match self {
            DemotionResult::Success { group_to, .. }
            | DemotionResult::MalformedTrack { group_to } => Some(group_to),
            _ => None,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(
            self,
            DemotionResult::Success { .. }
                | DemotionResult::RemovedFromFirstGroup {
                    group_from: Some(_)
                }
        )
    }
}

/// Filter which accepts every group.
pub fn allow_all(_group: &str) -> bool {
    true
}

/// Move the user one group up the track.
///
/// `exists` tells whether a group is known, `filter` is the caller's gate for the group the user
/// would be moved into. Memberships are added and removed with exactly the given contexts. When the
/// contexts are empty and the user's primary group was the old group, it follows to the new one.
pub fn promote<U, E, F>(
    user: &mut User<U>,
    track: &Track,
    contexts: &ContextSet,
    now: Timestamp,
    exists: E,
    filter: F,
    add_to_first: bool,
) -> PromotionResult
where
    U: IdentityHandle,
    E: Fn(&str) -> bool,
    F: Fn(&str) -> bool,
{
    let current = track.current_groups(user, contexts, now);

    let result = match current.as_slice() {
        [] => {
            let Some(first) = track.groups.first() else {
                return PromotionResult::NotOnTrack;
            };

            if !add_to_first {
                PromotionResult::NotOnTrack
            } else if !exists(first) {
                PromotionResult::MalformedTrack {
                    group_to: first.clone(),
                }
            } else if !filter(first) {
                PromotionResult::UndefinedFailure
            } else {
                match membership(first, contexts) {
                    Some(node) => {
                        user.nodes_mut().set(node);
                        PromotionResult::AddedToFirstGroup {
                            group_to: first.clone(),
                        }
                    }
                    None => PromotionResult::MalformedTrack {
                        group_to: first.clone(),
                    },
                }
            }
        }
        [old] => match track.next(old) {
            None => PromotionResult::NotApplicable,
            Some(next) if !exists(next) => PromotionResult::MalformedTrack {
                group_to: next.to_string(),
            },
            Some(next) if !filter(next) => PromotionResult::UndefinedFailure,
            Some(next) => match move_membership(user, old, next, contexts) {
                true => PromotionResult::Success {
                    group_from: old.clone(),
                    group_to: next.to_string(),
                },
                false => PromotionResult::MalformedTrack {
                    group_to: next.to_string(),
                },
            },
        },
        _ => PromotionResult::AmbiguousCall,
    };

    debug!(user = %user.user_id(), track = track.name(), ?result, "promote");
    result
}

/// Move the user one group down the track.
///
/// On the first group of the track the membership is removed when `remove_from_first` is set,
/// otherwise nothing changes and `RemovedFromFirstGroup` without `group_from` is returned. The
/// filter is asked about the group the user moves into or, when they are removed from the first
/// group, about the group they leave. A removed primary group falls back to `fallback_primary`.
#[allow(clippy::too_many_arguments)]
pub fn demote<U, E, F>(
    user: &mut User<U>,
    track: &Track,
    contexts: &ContextSet,
    now: Timestamp,
    exists: E,
    filter: F,
    remove_from_first: bool,
    fallback_primary: &str,
) -> DemotionResult
where
    U: IdentityHandle,
    E: Fn(&str) -> bool,
    F: Fn(&str) -> bool,
{
    let current = track.current_groups(user, contexts, now);

    let result = match current.as_slice() {
        [] => DemotionResult::NotOnTrack,
        [old] => match track.previous(old) {
            None if !remove_from_first => DemotionResult::RemovedFromFirstGroup { group_from: None },
            None if !filter(old) => DemotionResult::UndefinedFailure,
            None => {
                user.nodes_mut()
                    .unset(&format!("{INHERITANCE_PREFIX}{old}"), contexts);
                if contexts.is_empty() && user.primary_group() == old.as_str() {
                    user.replace_primary_group(fallback_primary);
                }
                DemotionResult::RemovedFromFirstGroup {
                    group_from: Some(old.clone()),
                }
            }
            Some(previous) if !exists(previous) => DemotionResult::MalformedTrack {
                group_to: previous.to_string(),
            },
            Some(previous) if !filter(previous) => DemotionResult::UndefinedFailure,
            Some(previous) => match move_membership(user, old, previous, contexts) {
                true => DemotionResult::Success {
                    group_from: old.clone(),
                    group_to: previous.to_string(),
                },
                false => DemotionResult::MalformedTrack {
                    group_to: previous.to_string(),
                },
            },
        },
        _ => DemotionResult::AmbiguousCall,
    };

    debug!(user = %user.user_id(), track = track.name(), ?result, "demote");
    result
}

fn membership(group: &str, contexts: &ContextSet) -> Option<Node> {
    Node::inheritance(group)
        .ok()
        .map(|node| node.with_contexts(contexts.clone()))
}

/// Replace membership in `from` by membership in `to`, both scoped to the given contexts.
fn move_membership<U: IdentityHandle>(
    user: &mut User<U>,
    from: &str,
    to: &str,
    contexts: &ContextSet,
) -> bool {
    let Some(node) = membership(to, contexts) else {
        return false;
    };

    user.nodes_mut()
        .unset(&format!("{INHERITANCE_PREFIX}{from}"), contexts);
    user.nodes_mut().set(node);

    if contexts.is_empty() && user.primary_group() == from {
        user.replace_primary_group(to);
    }

    true
}
