// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the collaborators a [`Manager`](crate::Manager) depends on.
mod audit;
mod clock;
mod storage;

pub use audit::{Actor, AuditEntry, AuditSink, AuditTarget, NoAudit};
pub use clock::{Clock, SystemClock};
pub use storage::Storage;
