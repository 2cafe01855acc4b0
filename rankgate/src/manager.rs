// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry point tying holders, tracks, the resolution cache and persistence together.
//!
//! The manager keeps an immutable snapshot of every loaded user, group and track. Queries resolve
//! against these snapshots without blocking. Changes to one record are serialised through a lock per
//! record: the snapshot is cloned, edited and swapped in, then cached resolutions depending on it are
//! invalidated, an audit entry is submitted and the new state is queued for persistence.
use std::fmt::{Debug, Display};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStats, ResolutionCache};
use crate::calculator::{ResolvedNode, ResolvedPermissions, Tristate, calculate};
use crate::config::Config;
use crate::context::ContextSet;
use crate::graph::{GroupLookup, inheritance_cycles};
use crate::holder::{
    Group, Holder, HolderId, IdentityHandle, MutateResult, NameError, NodeMap, PermissionHolder, User,
    validate_name,
};
use crate::locks::LockRegistry;
use crate::node::{INHERITANCE_PREFIX, Node, NodeError};
use crate::persist::{Job, PersistError, PersistQueue, SaveHandle};
use crate::search::{HeldNode, NodeQuery, search};
use crate::track::{DemotionResult, PromotionResult, Track, TrackMutation, demote, promote};
use crate::traits::{Actor, AuditEntry, AuditSink, AuditTarget, Clock, NoAudit, Storage, SystemClock};

#[derive(Debug, Error)]
pub enum ManagerError<E: Debug + Display> {
    #[error("storage error: {0}")]
    Storage(E),

    #[error("user {0} is not loaded")]
    UnknownUser(String),

    #[error("group {0} does not exist")]
    UnknownGroup(String),

    #[error("track {0} does not exist")]
    UnknownTrack(String),

    #[error("group {0} already exists")]
    GroupExists(String),

    #[error("track {0} already exists")]
    TrackExists(String),

    #[error("no tokio runtime to run the persistence worker on")]
    NoRuntime,

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Outcome of a change together with the handle of its pending write.
#[derive(Debug)]
#[must_use]
pub struct Mutation<T, E: Debug + Display> {
    pub result: T,
    pub save: SaveHandle<E>,
}

impl<T, E: Debug + Display> Mutation<T, E> {
    fn unchanged(result: T) -> Self {
        Self {
            result,
            save: SaveHandle::done(),
        }
    }

    /// Wait until the change was written to storage and return its outcome.
    pub async fn durable(self) -> Result<T, PersistError<E>> {
        self.save.wait().await?;
        Ok(self.result)
    }
}

/// Answer to "which track did the caller mean" when none was named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackSelection {
    Selected(Arc<Track>),

    /// The track which would be picked has fewer than two groups, nobody can move along it.
    TooShort(Arc<Track>),

    NoTracks,

    /// Several tracks exist and none carries the default name.
    Ambiguous(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum LockKey<U> {
    Holder(HolderId<U>),
    Track(String),
}

/// Holder being edited inside a locked section.
enum Edit<'a, U> {
    User(&'a mut User<U>),
    Group(&'a mut Group),
}

impl<U: IdentityHandle> Edit<'_, U> {
    fn nodes(&mut self) -> &mut NodeMap {
        match self {
            Edit::User(user) => user.nodes_mut(),
            Edit::Group(group) => group.nodes_mut(),
        }
    }
}

impl GroupLookup for DashMap<String, Arc<Group>> {
    fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.get(name).map(|group| group.value().clone())
    }
}

type ManagerResult<T, E> = Result<T, ManagerError<E>>;

pub struct Manager<U, S, A = NoAudit, C = SystemClock>
where
    U: IdentityHandle,
    S: Storage<U>,
{
    config: Config,
    storage: Arc<S>,
    audit: A,
    clock: C,
    users: DashMap<U, Arc<User<U>>>,
    groups: DashMap<String, Arc<Group>>,
    tracks: DashMap<String, Arc<Track>>,
    cache: ResolutionCache<U>,
    locks: LockRegistry<LockKey<U>>,
    persist: PersistQueue<U, S::Error>,
}

impl<U, S> Manager<U, S>
where
    U: IdentityHandle,
    S: Storage<U>,
{
    /// Create a manager without audit log, reading the system clock.
    ///
    /// Needs to be called from within a tokio runtime, the persistence worker is spawned on it.
    /// Returns [`ManagerError::NoRuntime`] otherwise.
    pub fn new(storage: S, config: Config) -> ManagerResult<Self, S::Error> {
        Self::from_parts(storage, NoAudit, SystemClock, config)
    }
}

impl<U, S, A, C> Manager<U, S, A, C>
where
    U: IdentityHandle,
    S: Storage<U>,
    A: AuditSink<U>,
    C: Clock,
{
    pub fn from_parts(
        storage: S,
        audit: A,
        clock: C,
        mut config: Config,
    ) -> ManagerResult<Self, S::Error> {
        config.default_group = validate_name(&config.default_group)?;
        config.default_track = validate_name(&config.default_track)?;

        let storage = Arc::new(storage);
        let persist =
            PersistQueue::spawn(storage.clone()).map_err(|_| ManagerError::NoRuntime)?;

        Ok(Self {
            cache: ResolutionCache::new(config.cache_capacity),
            persist,
            config,
            storage,
            audit,
            clock,
            users: DashMap::new(),
            groups: DashMap::new(),
            tracks: DashMap::new(),
            locks: LockRegistry::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Loading
    // ~~~~~~~

    /// Load a user from storage, or create them in the default group if storage does not know them.
    ///
    /// Returns the in-memory snapshot if the user is already loaded.
    pub async fn load_user(&self, id: U) -> ManagerResult<Arc<User<U>>, S::Error> {
        let holder = HolderId::User(id);
        let _guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;

        if let Some(user) = self.user(id) {
            return Ok(user);
        }

        let user = match self
            .storage
            .load_user(id)
            .await
            .map_err(ManagerError::Storage)?
        {
            Some(user) => user,
            None => User::new(id, &self.config.default_group)?,
        };

        let user = Arc::new(user);
        self.users.insert(id, user.clone());
        self.cache.invalidate(&holder);
        debug!(user = %id, "loaded user");
        Ok(user)
    }

    /// Drop a user's snapshot and cached resolutions, for example when they log off.
    pub async fn unload_user(&self, id: U) -> bool {
        let holder = HolderId::User(id);
        let guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;
        let removed = self.users.remove(&id).is_some();
        self.cache.invalidate(&holder);
        drop(guard);

        self.locks.prune();
        removed
    }

    pub async fn load_group(&self, name: &str) -> ManagerResult<Arc<Group>, S::Error> {
        let name = validate_name(name)?;
        let holder = HolderId::Group(name.clone());
        let _guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;

        if let Some(group) = self.group(&name) {
            return Ok(group);
        }

        let group = self
            .storage
            .load_group(&name)
            .await
            .map_err(ManagerError::Storage)?
            .ok_or_else(|| ManagerError::UnknownGroup(name.clone()))?;

        let group = Arc::new(group);
        self.groups.insert(name.clone(), group.clone());

        // Users whose resolution skipped this group as missing depend on it as well.
        self.cache.invalidate(&holder);
        debug!(group = %name, "loaded group");
        Ok(group)
    }

    pub async fn load_track(&self, name: &str) -> ManagerResult<Arc<Track>, S::Error> {
        let name = validate_name(name)?;
        let _guard = self.locks.lock(&LockKey::Track(name.clone())).await;

        if let Some(track) = self.track(&name) {
            return Ok(track);
        }

        let track = self
            .storage
            .load_track(&name)
            .await
            .map_err(ManagerError::Storage)?
            .ok_or_else(|| ManagerError::UnknownTrack(name.clone()))?;

        let track = Arc::new(track);
        self.tracks.insert(name.clone(), track.clone());
        debug!(track = %name, "loaded track");
        Ok(track)
    }

    pub async fn create_group(
        &self,
        name: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<Arc<Group>, S::Error>, S::Error> {
        let group = Group::new(name)?;
        let holder = HolderId::Group(group.name().to_string());
        let _guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;

        if self.groups.contains_key(group.name())
            || self
                .storage
                .load_group(group.name())
                .await
                .map_err(ManagerError::Storage)?
                .is_some()
        {
            return Err(ManagerError::GroupExists(group.name().to_string()));
        }

        let group = Arc::new(group);
        self.groups.insert(group.name().to_string(), group.clone());
        self.cache.invalidate(&holder);
        self.submit(actor, AuditTarget::Holder(holder), "create", ContextSet::new());
        let save = self.persist.enqueue(Job::SaveGroup(group.clone()));

        Ok(Mutation {
            result: group,
            save,
        })
    }

    /// Delete a group.
    ///
    /// Inheritance nodes pointing at it stay in place and are skipped during resolution, tracks
    /// containing it become malformed.
    pub async fn delete_group(
        &self,
        name: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<(), S::Error>, S::Error> {
        let name = validate_name(name)?;
        let holder = HolderId::Group(name.clone());
        let _guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;

        if self.groups.remove(&name).is_none() {
            return Err(ManagerError::UnknownGroup(name));
        }

        self.cache.invalidate(&holder);
        self.submit(actor, AuditTarget::Holder(holder), "delete", ContextSet::new());
        let save = self.persist.enqueue(Job::DeleteGroup(name));

        Ok(Mutation { result: (), save })
    }

    pub async fn create_track(
        &self,
        name: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<Arc<Track>, S::Error>, S::Error> {
        let track = Track::new(name)?;
        let _guard = self.locks.lock(&LockKey::Track(track.name().to_string())).await;

        if self.tracks.contains_key(track.name())
            || self
                .storage
                .load_track(track.name())
                .await
                .map_err(ManagerError::Storage)?
                .is_some()
        {
            return Err(ManagerError::TrackExists(track.name().to_string()));
        }

        let track = Arc::new(track);
        self.tracks.insert(track.name().to_string(), track.clone());
        self.submit(
            actor,
            AuditTarget::Track(track.name().to_string()),
            "create",
            ContextSet::new(),
        );
        let save = self.persist.enqueue(Job::SaveTrack(track.clone()));

        Ok(Mutation {
            result: track,
            save,
        })
    }

    pub async fn delete_track(
        &self,
        name: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<(), S::Error>, S::Error> {
        let name = validate_name(name)?;
        let _guard = self.locks.lock(&LockKey::Track(name.clone())).await;

        if self.tracks.remove(&name).is_none() {
            return Err(ManagerError::UnknownTrack(name));
        }

        self.submit(
            actor,
            AuditTarget::Track(name.clone()),
            "delete",
            ContextSet::new(),
        );
        let save = self.persist.enqueue(Job::DeleteTrack(name));

        Ok(Mutation { result: (), save })
    }

    // Snapshots
    // ~~~~~~~~~

    pub fn user(&self, id: U) -> Option<Arc<User<U>>> {
        self.users.get(&id).map(|user| user.value().clone())
    }

    pub fn group(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(&normalise(name)).map(|group| group.value().clone())
    }

    pub fn track(&self, name: &str) -> Option<Arc<Track>> {
        self.tracks.get(&normalise(name)).map(|track| track.value().clone())
    }

    /// Names of all loaded groups, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|group| group.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of all loaded tracks, sorted.
    pub fn track_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tracks.iter().map(|track| track.key().clone()).collect();
        names.sort();
        names
    }

    fn holder(&self, id: &HolderId<U>) -> Option<Holder<U>> {
        match id {
            HolderId::User(id) => self.user(*id).map(Holder::User),
            HolderId::Group(name) => self.group(name).map(Holder::Group),
        }
    }

    fn unknown(&self, id: &HolderId<U>) -> ManagerError<S::Error> {
        match id {
            HolderId::User(id) => ManagerError::UnknownUser(id.to_string()),
            HolderId::Group(name) => ManagerError::UnknownGroup(name.clone()),
        }
    }

    // Queries
    // ~~~~~~~

    /// Effective permissions of a loaded holder under the given active contexts.
    pub fn resolve(
        &self,
        holder: &HolderId<U>,
        contexts: &ContextSet,
    ) -> ManagerResult<Arc<ResolvedPermissions<U>>, S::Error> {
        let snapshot = self.holder(holder).ok_or_else(|| self.unknown(holder))?;
        let key = CacheKey::new(holder.clone(), contexts.clone());
        let now = self.clock.now();
        let max_depth = self.config.max_inheritance_depth;

        // The snapshot is read again inside the computation, so a change committed before the cache
        // drew its generation is always seen.
        let resolved = self.cache.get_or_compute(&key, now, || {
            match self.holder(holder).unwrap_or_else(|| snapshot.clone()) {
                Holder::User(user) => calculate(user.as_ref(), contexts, now, &self.groups, max_depth),
                Holder::Group(group) => {
                    calculate::<U, _, _>(group.as_ref(), contexts, now, &self.groups, max_depth)
                }
            }
        });

        Ok(resolved)
    }

    pub fn check(
        &self,
        holder: &HolderId<U>,
        key: &str,
        contexts: &ContextSet,
    ) -> ManagerResult<Tristate, S::Error> {
        Ok(self.resolve(holder, contexts)?.check(key))
    }

    /// Like [`Manager::check`] but also returns the node which decided the query and its origin.
    pub fn check_detailed(
        &self,
        holder: &HolderId<U>,
        key: &str,
        contexts: &ContextSet,
    ) -> ManagerResult<Option<ResolvedNode<U>>, S::Error> {
        Ok(self.resolve(holder, contexts)?.check_detailed(key).cloned())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached resolution, for example after storage was edited behind the manager's back.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    /// Groups of all loaded groups which inherit from each other in a loop.
    pub fn inheritance_cycles(&self) -> Vec<Vec<String>> {
        let groups: Vec<Arc<Group>> = self.groups.iter().map(|group| group.value().clone()).collect();
        inheritance_cycles(groups.iter().map(Arc::as_ref))
    }

    /// Every loaded holder's own node matching the query.
    pub fn search(&self, query: &NodeQuery) -> Vec<HeldNode<U>> {
        let holders: Vec<Holder<U>> = self
            .users
            .iter()
            .map(|user| Holder::User(user.value().clone()))
            .chain(
                self.groups
                    .iter()
                    .map(|group| Holder::Group(group.value().clone())),
            )
            .collect();
        search(holders, query)
    }

    // Node mutations
    // ~~~~~~~~~~~~~~

    /// Set a node on a holder, replacing a node with the same key and contexts.
    pub async fn set_node(
        &self,
        holder: &HolderId<U>,
        node: Node,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let contexts = node.contexts().clone();
        let description = match node.expiry() {
            Some(expiry) => format!("set {}={} until {expiry}", node.key(), node.value()),
            None => format!("set {}={}", node.key(), node.value()),
        };

        self.edit_holder(holder, actor, contexts, move |mut edit| {
            let result = edit.nodes().set(node);
            (result, result.was_successful().then_some(description))
        })
        .await
    }

    pub async fn unset_node(
        &self,
        holder: &HolderId<U>,
        key: &str,
        contexts: &ContextSet,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let description = format!("unset {}", key.trim().to_lowercase());
        self.edit_holder(holder, actor, contexts.clone(), |mut edit| {
            let result = edit.nodes().unset(key, contexts);
            (result, result.was_successful().then_some(description))
        })
        .await
    }

    /// Make a holder inherit from a loaded group under the given contexts.
    pub async fn add_parent(
        &self,
        holder: &HolderId<U>,
        group: &str,
        contexts: &ContextSet,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let node = Node::inheritance(group)?.with_contexts(contexts.clone());
        let Some(parent) = node.group_name().map(str::to_string) else {
            return Err(ManagerError::UnknownGroup(group.to_string()));
        };

        if !self.groups.contains_key(&parent) {
            return Err(ManagerError::UnknownGroup(parent));
        }

        let description = format!("parent add {parent}");
        self.edit_holder(holder, actor, contexts.clone(), move |mut edit| {
            let result = edit.nodes().set(node);
            (result, result.was_successful().then_some(description))
        })
        .await
    }

    /// Stop a holder from inheriting a group under the given contexts.
    ///
    /// Removing a user's primary group globally moves their primary group to the default group.
    pub async fn remove_parent(
        &self,
        holder: &HolderId<U>,
        group: &str,
        contexts: &ContextSet,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let group = validate_name(group)?;
        let description = format!("parent remove {group}");
        let default_group = self.config.default_group.as_str();

        self.edit_holder(holder, actor, contexts.clone(), |mut edit| {
            let result = edit
                .nodes()
                .unset(&format!("{INHERITANCE_PREFIX}{group}"), contexts);

            if let Edit::User(user) = edit {
                if result.was_successful() && contexts.is_empty() && user.primary_group() == group {
                    user.replace_primary_group(default_group);
                }
            }

            (result, result.was_successful().then_some(description))
        })
        .await
    }

    pub async fn set_group_weight(
        &self,
        name: &str,
        weight: i32,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let name = validate_name(name)?;
        self.modify_group(&name, actor, ContextSet::new(), |group| {
            if group.weight() == weight {
                return (MutateResult::AlreadyHas, None);
            }

            group.set_weight(weight);
            (MutateResult::Success, Some(format!("set weight {weight}")))
        })
        .await
    }

    /// Switch a user's primary group, adding a global membership in it if needed.
    pub async fn set_primary_group(
        &self,
        id: U,
        group: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let group = validate_name(group)?;
        if !self.groups.contains_key(&group) {
            return Err(ManagerError::UnknownGroup(group));
        }

        let membership = Node::inheritance(&group)?;
        self.modify_user(id, actor, ContextSet::new(), |user| {
            if user.primary_group() == group {
                return (MutateResult::AlreadyHas, None);
            }

            user.nodes_mut().set(membership);
            user.replace_primary_group(&group);
            (MutateResult::Success, Some(format!("switch primary group to {group}")))
        })
        .await
    }

    /// Remove every expired node of a holder.
    pub async fn prune_expired(
        &self,
        holder: &HolderId<U>,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<MutateResult, S::Error>, S::Error> {
        let now = self.clock.now();
        self.edit_holder(holder, actor, ContextSet::new(), move |mut edit| {
            let expired = edit.nodes().prune_expired(now);
            if expired.is_empty() {
                (MutateResult::LacksNode, None)
            } else {
                let description = format!("prune {} expired nodes", expired.len());
                (MutateResult::Success, Some(description))
            }
        })
        .await
    }

    // Tracks
    // ~~~~~~

    /// Promote a user one group up a track.
    ///
    /// `filter` is asked whether the user may be moved into the target group.
    pub async fn promote<F>(
        &self,
        id: U,
        track: &str,
        contexts: &ContextSet,
        filter: F,
        add_to_first: bool,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<PromotionResult, S::Error>, S::Error>
    where
        F: Fn(&str) -> bool,
    {
        let track = self
            .track(track)
            .ok_or_else(|| ManagerError::UnknownTrack(normalise(track)))?;
        let exists = |group: &str| self.groups.contains_key(group);

        self.modify_user(id, actor, contexts.clone(), |user| {
            let now = self.clock.now();
            let result = promote(user, &track, contexts, now, exists, filter, add_to_first);

            if let PromotionResult::MalformedTrack { group_to } = &result {
                warn!(track = track.name(), group = %group_to, "track references unknown group");
            }

            let description = match &result {
                PromotionResult::Success {
                    group_from,
                    group_to,
                } => Some(format!(
                    "promote along {}: {group_from} -> {group_to}",
                    track.name()
                )),
                PromotionResult::AddedToFirstGroup { group_to } => Some(format!(
                    "promote along {}: added to {group_to}",
                    track.name()
                )),
                _ => None,
            };

            (result, description)
        })
        .await
    }

    /// Demote a user one group down a track.
    ///
    /// On the first group of the track the user is removed from it only if `remove_from_first` is
    /// set. `filter` is asked about the target group, or about the left group on the first one.
    pub async fn demote<F>(
        &self,
        id: U,
        track: &str,
        contexts: &ContextSet,
        filter: F,
        remove_from_first: bool,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<DemotionResult, S::Error>, S::Error>
    where
        F: Fn(&str) -> bool,
    {
        let track = self
            .track(track)
            .ok_or_else(|| ManagerError::UnknownTrack(normalise(track)))?;
        let exists = |group: &str| self.groups.contains_key(group);
        let default_group = self.config.default_group.as_str();

        self.modify_user(id, actor, contexts.clone(), |user| {
            let result = demote(
                user,
                &track,
                contexts,
                self.clock.now(),
                exists,
                filter,
                remove_from_first,
                default_group,
            );

            if let DemotionResult::MalformedTrack { group_to } = &result {
                warn!(track = track.name(), group = %group_to, "track references unknown group");
            }

            let description = match &result {
                DemotionResult::Success {
                    group_from,
                    group_to,
                } => Some(format!(
                    "demote along {}: {group_from} -> {group_to}",
                    track.name()
                )),
                DemotionResult::RemovedFromFirstGroup {
                    group_from: Some(group_from),
                } => Some(format!(
                    "demote along {}: removed from {group_from}",
                    track.name()
                )),
                _ => None,
            };

            (result, description)
        })
        .await
    }

    /// Add a loaded group to the end of a track.
    pub async fn append_to_track(
        &self,
        track: &str,
        group: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<TrackMutation, S::Error>, S::Error> {
        let group = validate_name(group)?;
        if !self.groups.contains_key(&group) {
            return Ok(Mutation::unchanged(TrackMutation::GroupNotFound));
        }

        self.modify_track(track, actor, |track| {
            let result = track.append(&group);
            (result, result.was_successful().then(|| format!("append {group}")))
        })
        .await
    }

    /// Insert a loaded group at the given position of a track, 0 being the lowest rank.
    pub async fn insert_into_track(
        &self,
        track: &str,
        group: &str,
        index: usize,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<TrackMutation, S::Error>, S::Error> {
        let group = validate_name(group)?;
        if !self.groups.contains_key(&group) {
            return Ok(Mutation::unchanged(TrackMutation::GroupNotFound));
        }

        self.modify_track(track, actor, |track| {
            let result = track.insert(&group, index);
            (
                result,
                result
                    .was_successful()
                    .then(|| format!("insert {group} at {index}")),
            )
        })
        .await
    }

    pub async fn remove_from_track(
        &self,
        track: &str,
        group: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<TrackMutation, S::Error>, S::Error> {
        let group = normalise(group);
        self.modify_track(track, actor, |track| {
            let result = track.remove(&group);
            (result, result.was_successful().then(|| format!("remove {group}")))
        })
        .await
    }

    pub async fn clear_track(
        &self,
        track: &str,
        actor: Actor<U>,
    ) -> ManagerResult<Mutation<TrackMutation, S::Error>, S::Error> {
        self.modify_track(track, actor, |track| {
            if track.is_empty() {
                return (TrackMutation::Success, None);
            }
            (track.clear(), Some("clear".to_string()))
        })
        .await
    }

    /// Groups a track references which are not loaded.
    pub fn malformed_groups(&self, track: &str) -> ManagerResult<Vec<String>, S::Error> {
        let track = self
            .track(track)
            .ok_or_else(|| ManagerError::UnknownTrack(normalise(track)))?;
        Ok(track.malformed_groups(|group| self.groups.contains_key(group)))
    }

    /// Pick the track a command without explicit track refers to.
    ///
    /// That is the only loaded track, or the one named like the configured default track.
    pub fn select_track(&self) -> TrackSelection {
        let selected = |track: Arc<Track>| {
            if track.len() < 2 {
                TrackSelection::TooShort(track)
            } else {
                TrackSelection::Selected(track)
            }
        };

        let names = self.track_names();
        match names.as_slice() {
            [] => TrackSelection::NoTracks,
            [name] => self.track(name).map_or(TrackSelection::NoTracks, selected),
            _ => match self.track(&self.config.default_track) {
                Some(track) => selected(track),
                None => TrackSelection::Ambiguous(names),
            },
        }
    }

    /// Resolves once every change committed so far was handed to storage.
    pub async fn flush(&self) -> Result<(), PersistError<S::Error>> {
        self.persist.enqueue(Job::Barrier).wait().await
    }

    // Commit helpers
    // ~~~~~~~~~~~~~~

    async fn edit_holder<T, F>(
        &self,
        holder: &HolderId<U>,
        actor: Actor<U>,
        contexts: ContextSet,
        change: F,
    ) -> ManagerResult<Mutation<T, S::Error>, S::Error>
    where
        F: FnOnce(Edit<'_, U>) -> (T, Option<String>),
    {
        match holder {
            HolderId::User(id) => {
                self.modify_user(*id, actor, contexts, |user| change(Edit::User(user)))
                    .await
            }
            HolderId::Group(name) => {
                self.modify_group(name, actor, contexts, |group| change(Edit::Group(group)))
                    .await
            }
        }
    }

    /// Apply a change to a copy of a loaded user and commit it if the change reports a description.
    async fn modify_user<T, F>(
        &self,
        id: U,
        actor: Actor<U>,
        contexts: ContextSet,
        change: F,
    ) -> ManagerResult<Mutation<T, S::Error>, S::Error>
    where
        F: FnOnce(&mut User<U>) -> (T, Option<String>),
    {
        let holder = HolderId::User(id);
        let _guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;

        let current = self.user(id).ok_or_else(|| self.unknown(&holder))?;
        let mut user = User::clone(&current);
        let (result, description) = change(&mut user);
        let Some(description) = description else {
            return Ok(Mutation::unchanged(result));
        };

        let user = Arc::new(user);
        let previous = self.users.insert(id, user.clone());
        debug_assert!(
            previous.is_some_and(|previous| Arc::ptr_eq(&previous, &current)),
            "user snapshot was replaced without holding its lock"
        );

        self.cache.invalidate(&holder);
        debug!(user = %id, %description, %contexts, "changed user");
        self.submit(actor, AuditTarget::Holder(holder), &description, contexts);
        let save = self.persist.enqueue(Job::SaveUser(user));

        Ok(Mutation { result, save })
    }

    async fn modify_group<T, F>(
        &self,
        name: &str,
        actor: Actor<U>,
        contexts: ContextSet,
        change: F,
    ) -> ManagerResult<Mutation<T, S::Error>, S::Error>
    where
        F: FnOnce(&mut Group) -> (T, Option<String>),
    {
        let holder = HolderId::Group(normalise(name));
        let _guard = self.locks.lock(&LockKey::Holder(holder.clone())).await;

        let current = self.group(name).ok_or_else(|| self.unknown(&holder))?;
        let mut group = Group::clone(&current);
        let (result, description) = change(&mut group);
        let Some(description) = description else {
            return Ok(Mutation::unchanged(result));
        };

        let group = Arc::new(group);
        let previous = self.groups.insert(group.name().to_string(), group.clone());
        debug_assert!(
            previous.is_some_and(|previous| Arc::ptr_eq(&previous, &current)),
            "group snapshot was replaced without holding its lock"
        );

        // Every cached resolution which walked through this group lists it as a dependency.
        self.cache.invalidate(&holder);
        debug!(group = %group.name(), %description, %contexts, "changed group");
        self.submit(actor, AuditTarget::Holder(holder), &description, contexts);
        let save = self.persist.enqueue(Job::SaveGroup(group));

        Ok(Mutation { result, save })
    }

    async fn modify_track<T, F>(
        &self,
        name: &str,
        actor: Actor<U>,
        change: F,
    ) -> ManagerResult<Mutation<T, S::Error>, S::Error>
    where
        F: FnOnce(&mut Track) -> (T, Option<String>),
    {
        let name = normalise(name);
        let _guard = self.locks.lock(&LockKey::Track(name.clone())).await;

        let current = self
            .track(&name)
            .ok_or_else(|| ManagerError::UnknownTrack(name.clone()))?;
        let mut track = Track::clone(&current);
        let (result, description) = change(&mut track);
        let Some(description) = description else {
            return Ok(Mutation::unchanged(result));
        };

        let track = Arc::new(track);
        let previous = self.tracks.insert(name.clone(), track.clone());
        debug_assert!(
            previous.is_some_and(|previous| Arc::ptr_eq(&previous, &current)),
            "track snapshot was replaced without holding its lock"
        );

        debug!(track = %name, %description, "changed track");
        self.submit(
            actor,
            AuditTarget::Track(name),
            &description,
            ContextSet::new(),
        );
        let save = self.persist.enqueue(Job::SaveTrack(track));

        Ok(Mutation { result, save })
    }

    fn submit(
        &self,
        actor: Actor<U>,
        target: AuditTarget<U>,
        description: &str,
        contexts: ContextSet,
    ) {
        self.audit.submit(AuditEntry {
            actor,
            target,
            description: description.to_string(),
            contexts,
        });
    }
}

fn normalise(name: &str) -> String {
    name.trim().to_lowercase()
}
