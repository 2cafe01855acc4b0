// SPDX-License-Identifier: MIT OR Apache-2.0

//! Permission resolution over users and groups, with context-scoped nodes, weighted inheritance and
//! promotion tracks.
//!
//! A [`Manager`] holds snapshots of loaded users, groups and tracks, answers permission checks from a
//! resolution cache and serialises changes per holder before handing them to [`Storage`].
pub mod cache;
pub mod calculator;
mod config;
pub mod context;
pub mod graph;
pub mod holder;
mod locks;
mod manager;
pub mod node;
mod persist;
pub mod search;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod track;
pub mod traits;

pub use calculator::{ResolvedNode, ResolvedPermissions, Tristate};
pub use config::Config;
pub use context::ContextSet;
pub use holder::{Group, HolderId, IdentityHandle, MutateResult, NameError, User};
pub use manager::{Manager, ManagerError, Mutation, TrackSelection};
pub use node::{Node, NodeError, Timestamp};
pub use persist::{PersistError, SaveHandle};
pub use search::{HeldNode, NodeQuery};
pub use track::{DemotionResult, PromotionResult, Track, TrackMutation};
pub use traits::{Actor, AuditEntry, AuditSink, Clock, Storage};
