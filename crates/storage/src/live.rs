use std::future::Future;

use anyhow::{Context, Result};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use shared::domain::{EnrollmentId, EnrollmentStatus, Identity, MessageId, ProgramId};

use crate::Storage;

/// Committed write as recorded in the change journal, from this process or another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    ProgramUpserted {
        program_id: ProgramId,
    },
    ProgramDeleted {
        program_id: ProgramId,
    },
    EnrollmentCreated {
        enrollment_id: EnrollmentId,
        program_id: ProgramId,
    },
    EnrollmentUpdated {
        enrollment_id: EnrollmentId,
        program_id: ProgramId,
        status: EnrollmentStatus,
    },
    MessageCreated {
        message_id: MessageId,
        receiver: Identity,
    },
    MessageRead {
        message_id: MessageId,
    },
}

impl RecordChange {
    pub fn program_id(&self) -> Option<ProgramId> {
        match self {
            RecordChange::ProgramUpserted { program_id }
            | RecordChange::ProgramDeleted { program_id }
            | RecordChange::EnrollmentCreated { program_id, .. }
            | RecordChange::EnrollmentUpdated { program_id, .. } => Some(*program_id),
            RecordChange::MessageCreated { .. } | RecordChange::MessageRead { .. } => None,
        }
    }

    pub fn touches_program(&self, program_id: ProgramId) -> bool {
        self.program_id() == Some(program_id)
    }
}

/// Result set of a query that is re-evaluated whenever a matching change is committed.
///
/// The background listener is stopped by [`LiveQuery::unsubscribe`] or by dropping the handle.
pub struct LiveQuery<T> {
    rx: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Clone> LiveQuery<T> {
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Waits for the next result set. `None` once the query target is gone or the
    /// listener has stopped.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Storage {
    /// Live query primitive: `load` is evaluated now and again after every committed change
    /// for which `matches` returns true. Observers are only woken when the result differs.
    /// `load` returning `None` means the target no longer exists and ends the subscription.
    pub async fn subscribe<T, M, F, Fut>(&self, matches: M, load: F) -> Result<LiveQuery<T>>
    where
        T: PartialEq + Send + Sync + 'static,
        M: Fn(&RecordChange) -> bool + Send + 'static,
        F: Fn(Storage) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        // Listen before the first read so a write landing in between is not lost.
        let mut changes = self.watch_changes();
        let initial = load(self.clone())
            .await?
            .context("live query target does not exist")?;
        let (tx, rx) = watch::channel(initial);

        let storage = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) if matches(&change) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "live query fell behind the change feed; reloading");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                match load(storage.clone()).await {
                    Ok(Some(next)) => {
                        if tx.is_closed() {
                            break;
                        }
                        // Identical result sets are not re-delivered.
                        tx.send_if_modified(|current| {
                            if *current == next {
                                return false;
                            }
                            *current = next;
                            true
                        });
                    }
                    Ok(None) => {
                        debug!("live query target removed; ending subscription");
                        break;
                    }
                    Err(error) => warn!(%error, "live query reload failed; keeping last result"),
                }
            }
        });

        Ok(LiveQuery { rx, task })
    }
}
