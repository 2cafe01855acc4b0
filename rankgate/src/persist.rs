// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered write-behind persistence.
//!
//! Every committed change is handed to a single worker task which writes it to storage in commit
//! order. Callers get a [`SaveHandle`] back and can wait on it when they need the change to be
//! durable. A failed write is logged and reported through the handle, the in-memory state stays as
//! it is.
use std::fmt::{Debug, Display};
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::holder::{Group, IdentityHandle, User};
use crate::traits::Storage;
use crate::track::Track;

#[derive(Debug, Error)]
pub enum PersistError<E: Debug + Display> {
    #[error("storage failed to persist {target}: {error}")]
    Storage { target: String, error: E },

    #[error("persistence worker stopped before the change was written")]
    WorkerGone,
}

/// A write waiting in the queue.
#[derive(Debug)]
pub(crate) enum Job<U> {
    SaveUser(Arc<User<U>>),
    SaveGroup(Arc<Group>),
    SaveTrack(Arc<Track>),
    DeleteGroup(String),
    DeleteTrack(String),

    /// Completes once every job queued before it was handled.
    Barrier,
}

impl<U: IdentityHandle> Display for Job<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::SaveUser(user) => write!(f, "user:{}", user.user_id()),
            Job::SaveGroup(group) => write!(f, "group:{}", group.name()),
            Job::SaveTrack(track) => write!(f, "track:{}", track.name()),
            Job::DeleteGroup(name) => write!(f, "deletion of group:{name}"),
            Job::DeleteTrack(name) => write!(f, "deletion of track:{name}"),
            Job::Barrier => write!(f, "barrier"),
        }
    }
}

type Reply<E> = oneshot::Sender<Result<(), PersistError<E>>>;

/// Receiving end of a queued write.
#[derive(Debug)]
#[must_use = "dropping the handle does not cancel the write, but its outcome is lost"]
pub struct SaveHandle<E: Debug + Display> {
    rx: Option<oneshot::Receiver<Result<(), PersistError<E>>>>,
}

impl<E: Debug + Display> SaveHandle<E> {
    /// Handle for a change which did not need to be written.
    pub fn done() -> Self {
        Self { rx: None }
    }

    /// Returns `true` if a write was queued for this change.
    pub fn is_pending(&self) -> bool {
        self.rx.is_some()
    }

    /// Wait until the change was written to storage.
    pub async fn wait(self) -> Result<(), PersistError<E>> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| PersistError::WorkerGone)?,
        }
    }
}

/// Sending side of the persistence worker.
#[derive(Debug)]
pub(crate) struct PersistQueue<U, E: Debug + Display> {
    tx: mpsc::UnboundedSender<(Job<U>, Reply<E>)>,
}

impl<U, E> PersistQueue<U, E>
where
    U: IdentityHandle,
    E: Debug + Display + Send + Sync + 'static,
{
    /// Spawn the worker on the current tokio runtime, fails when called outside of one.
    pub fn spawn<S>(storage: Arc<S>) -> Result<Self, TryCurrentError>
    where
        S: Storage<U, Error = E>,
    {
        let runtime = Handle::try_current()?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run(storage, rx));
        Ok(Self { tx })
    }

    pub fn enqueue(&self, job: Job<U>) -> SaveHandle<E> {
        let (reply, rx) = oneshot::channel();

        // If the worker is gone the reply sender is dropped with the job and the handle reports it.
        if let Err(mpsc::error::SendError((job, _))) = self.tx.send((job, reply)) {
            warn!(%job, "persistence worker stopped, change was not queued");
        }

        SaveHandle { rx: Some(rx) }
    }
}

async fn run<U, S>(storage: Arc<S>, mut rx: mpsc::UnboundedReceiver<(Job<U>, Reply<S::Error>)>)
where
    U: IdentityHandle,
    S: Storage<U>,
{
    while let Some((job, reply)) = rx.recv().await {
        let result = match &job {
            Job::SaveUser(user) => storage.save_user(user).await,
            Job::SaveGroup(group) => storage.save_group(group).await,
            Job::SaveTrack(track) => storage.save_track(track).await,
            Job::DeleteGroup(name) => storage.delete_group(name).await,
            Job::DeleteTrack(name) => storage.delete_track(name).await,
            Job::Barrier => Ok(()),
        };

        let result = result.map_err(|error| {
            warn!(record = %job, %error, "failed to persist change");
            PersistError::Storage {
                target: job.to_string(),
                error,
            }
        });

        if result.is_ok() {
            trace!(record = %job, "persisted change");
        }

        // Nobody waiting for the outcome is fine.
        let _ = reply.send(result);
    }
}
