//! The persistence contract the job runtime relies on.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreError;
use crate::job::StoredJob;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Controls how [`JobStore::insert`] records a job.
#[derive(Debug, Clone, Copy)]
pub struct InsertOptions {
    /// When `false`, the job is fed to the live stream but skips the durable
    /// write: a fast path for work whose loss on restart is acceptable.
    pub should_persist: bool,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            should_persist: true,
        }
    }
}

/// Storage for job records. Inserts and deletes are single-record atomic
/// operations; no cross-record transactions are required of an
/// implementation.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Records a job and feeds it to any live stream for its queue type.
    async fn insert(&self, job: &StoredJob, options: InsertOptions) -> Result<(), StoreError>;

    /// Removes a job record. Called on terminal success, terminal failure,
    /// or explicit cancellation.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// An unbounded, append-as-you-go sequence of jobs for one queue type:
    /// everything currently persisted (in timestamp order), then jobs as
    /// they are inserted. One consumer per queue type.
    fn stream(&self, queue_type: &str) -> BoxStream<'static, StoredJob>;
}
