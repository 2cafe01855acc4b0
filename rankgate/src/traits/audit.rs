// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;

use crate::context::ContextSet;
use crate::holder::HolderId;

/// Who triggered a change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Actor<U> {
    User(U),

    /// Console, scheduled jobs or anything else acting on behalf of the system.
    System,
}

impl<U: Display> Display for Actor<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "{id}"),
            Actor::System => write!(f, "system"),
        }
    }
}

/// Record of one applied change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry<U> {
    pub actor: Actor<U>,

    /// Holder or track which was changed.
    pub target: AuditTarget<U>,

    /// Short machine-friendly description, for example `promote default -> mvp`.
    pub description: String,

    pub contexts: ContextSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditTarget<U> {
    Holder(HolderId<U>),
    Track(String),
}

impl<U: Display> Display for AuditTarget<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditTarget::Holder(id) => write!(f, "{id}"),
            AuditTarget::Track(name) => write!(f, "track:{name}"),
        }
    }
}

/// Receiver of audit entries.
///
/// Submission happens while the change is being committed, implementations should hand the entry
/// off (to a channel, a log file buffer, ..) rather than block.
pub trait AuditSink<U>: Send + Sync + 'static {
    fn submit(&self, entry: AuditEntry<U>);
}

/// Sink which drops every entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAudit;

impl<U> AuditSink<U> for NoAudit {
    fn submit(&self, _entry: AuditEntry<U>) {}
}
