// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::holder::{Group, IdentityHandle, User};
use crate::node::Timestamp;
use crate::track::Track;
use crate::traits::{AuditEntry, AuditSink, Clock, Storage};

impl IdentityHandle for char {}

pub type MemberId = char;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

#[derive(Debug, Error)]
pub enum MemoryStorageError {}

#[derive(Debug)]
struct Records<U> {
    users: HashMap<U, User<U>>,
    groups: HashMap<String, Group>,
    tracks: HashMap<String, Track>,

    /// Every write in the order it arrived.
    writes: Vec<String>,
}

/// Storage keeping everything in memory, clones share the same records.
#[derive(Clone, Debug)]
pub struct MemoryStorage<U>(Arc<RwLock<Records<U>>>);

impl<U: IdentityHandle> Default for MemoryStorage<U> {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(Records {
            users: HashMap::new(),
            groups: HashMap::new(),
            tracks: HashMap::new(),
            writes: Vec::new(),
        })))
    }
}

impl<U: IdentityHandle> MemoryStorage<U> {
    pub async fn insert_user(&self, user: User<U>) {
        self.0.write().await.users.insert(user.user_id(), user);
    }

    pub async fn insert_group(&self, group: Group) {
        self.0
            .write()
            .await
            .groups
            .insert(group.name().to_string(), group);
    }

    pub async fn insert_track(&self, track: Track) {
        self.0
            .write()
            .await
            .tracks
            .insert(track.name().to_string(), track);
    }

    pub async fn saved_user(&self, id: U) -> Option<User<U>> {
        self.0.read().await.users.get(&id).cloned()
    }

    pub async fn saved_group(&self, name: &str) -> Option<Group> {
        self.0.read().await.groups.get(name).cloned()
    }

    pub async fn saved_track(&self, name: &str) -> Option<Track> {
        self.0.read().await.tracks.get(name).cloned()
    }

    pub async fn writes(&self) -> Vec<String> {
        self.0.read().await.writes.clone()
    }
}

impl<U: IdentityHandle> Storage<U> for MemoryStorage<U> {
    type Error = MemoryStorageError;

    async fn load_user(&self, id: U) -> Result<Option<User<U>>, Self::Error> {
        Ok(self.saved_user(id).await)
    }

    async fn load_group(&self, name: &str) -> Result<Option<Group>, Self::Error> {
        Ok(self.saved_group(name).await)
    }

    async fn load_track(&self, name: &str) -> Result<Option<Track>, Self::Error> {
        Ok(self.saved_track(name).await)
    }

    async fn save_user(&self, user: &User<U>) -> Result<(), Self::Error> {
        let mut records = self.0.write().await;
        records.writes.push(format!("user:{}", user.user_id()));
        records.users.insert(user.user_id(), user.clone());
        Ok(())
    }

    async fn save_group(&self, group: &Group) -> Result<(), Self::Error> {
        let mut records = self.0.write().await;
        records.writes.push(format!("group:{}", group.name()));
        records
            .groups
            .insert(group.name().to_string(), group.clone());
        Ok(())
    }

    async fn save_track(&self, track: &Track) -> Result<(), Self::Error> {
        let mut records = self.0.write().await;
        records.writes.push(format!("track:{}", track.name()));
        records
            .tracks
            .insert(track.name().to_string(), track.clone());
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<(), Self::Error> {
        let mut records = self.0.write().await;
        records.writes.push(format!("delete group:{name}"));
        records.groups.remove(name);
        Ok(())
    }

    async fn delete_track(&self, name: &str) -> Result<(), Self::Error> {
        let mut records = self.0.write().await;
        records.writes.push(format!("delete track:{name}"));
        records.tracks.remove(name);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FailingStorageError {
    #[error("storage is unavailable")]
    Unavailable,
}

/// Memory storage whose writes can be switched to fail.
#[derive(Clone, Debug)]
pub struct FailingStorage<U> {
    pub inner: MemoryStorage<U>,
    failing: Arc<AtomicBool>,
}

impl<U: IdentityHandle> FailingStorage<U> {
    pub fn new(inner: MemoryStorage<U>) -> Self {
        Self {
            inner,
            failing: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), FailingStorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(FailingStorageError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl<U: IdentityHandle> Storage<U> for FailingStorage<U> {
    type Error = FailingStorageError;

    async fn load_user(&self, id: U) -> Result<Option<User<U>>, Self::Error> {
        Ok(self.inner.saved_user(id).await)
    }

    async fn load_group(&self, name: &str) -> Result<Option<Group>, Self::Error> {
        Ok(self.inner.saved_group(name).await)
    }

    async fn load_track(&self, name: &str) -> Result<Option<Track>, Self::Error> {
        Ok(self.inner.saved_track(name).await)
    }

    async fn save_user(&self, user: &User<U>) -> Result<(), Self::Error> {
        self.check()?;
        self.inner.insert_user(user.clone()).await;
        Ok(())
    }

    async fn save_group(&self, group: &Group) -> Result<(), Self::Error> {
        self.check()?;
        self.inner.insert_group(group.clone()).await;
        Ok(())
    }

    async fn save_track(&self, track: &Track) -> Result<(), Self::Error> {
        self.check()?;
        self.inner.insert_track(track.clone()).await;
        Ok(())
    }

    async fn delete_group(&self, _name: &str) -> Result<(), Self::Error> {
        self.check()
    }

    async fn delete_track(&self, _name: &str) -> Result<(), Self::Error> {
        self.check()
    }
}

/// Audit sink remembering every entry.
#[derive(Clone, Debug)]
pub struct RecordingAudit<U>(Arc<Mutex<Vec<AuditEntry<U>>>>);

impl<U> Default for RecordingAudit<U> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<U: Clone> RecordingAudit<U> {
    pub fn entries(&self) -> Vec<AuditEntry<U>> {
        self.0.lock().unwrap().clone()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|entry| entry.description)
            .collect()
    }
}

impl<U: Send + 'static> AuditSink<U> for RecordingAudit<U> {
    fn submit(&self, entry: AuditEntry<U>) {
        self.0.lock().unwrap().push(entry);
    }
}

/// Clock which only moves when told to.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self(Arc::new(AtomicU64::new(now)))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}
