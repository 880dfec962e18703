//! The job record in its three forms: as handed to the enqueuer, as
//! persisted, and as decoded immediately before execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::JobError;

/// One unit of scheduled work, as returned to the enqueuer. The enqueuer is
/// the only party entitled to observe the result, via [`Job::completion`].
#[derive(Debug)]
pub struct Job<T> {
    pub id: String,
    /// Creation time; drives per-key ordering and the remaining-time budget.
    pub timestamp: DateTime<Utc>,
    pub queue_type: String,
    pub data: T,
    pub completion: Completion,
}

/// The persisted projection of a job: what survives a restart. Stored
/// records are only ever inserted and deleted, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub queue_type: String,
    pub data: serde_json::Value,
}

/// A stored job whose payload has been decoded, produced by the runtime
/// immediately before execution.
#[derive(Debug, Clone)]
pub struct ParsedJob<T> {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub queue_type: String,
    pub data: T,
}

/// Settles exactly once when its job reaches a terminal state: `Ok(())` on
/// success, `Err(JobError)` when the retry budget is exhausted.
///
/// Written only by the runtime; read only by the enqueuer.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), JobError>>,
}

impl Completion {
    pub(crate) fn new(rx: oneshot::Receiver<Result<(), JobError>>) -> Self {
        Self { rx }
    }

    /// Waits for the job to settle. Returns `None` when the job was
    /// cancelled (shutdown, queue teardown) before reaching a terminal
    /// state: cancellation is not a failure, and such jobs never produce a
    /// result.
    pub async fn wait(self) -> Option<Result<(), JobError>> {
        self.rx.await.ok()
    }
}
