//! In-memory job store: the default for tests and for profiles where
//! durability across restarts is not required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use courier_sync::AsyncQueue;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use super::{InsertOptions, JobStore};
use crate::error::StoreError;
use crate::job::StoredJob;

/// An in-memory [`JobStore`]. Cloning yields a handle to the same store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    records: Vec<StoredJob>,
    queues: HashMap<String, Arc<AsyncQueue<StoredJob>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store already holding `jobs`, as if they had been persisted
    /// by a previous process. They are delivered first when their queue type
    /// is streamed.
    pub fn recovered(jobs: Vec<StoredJob>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for job in jobs {
                state.records.push(job.clone());
                queue_for(&mut state, &job.queue_type).add(job);
            }
        }
        store
    }

    /// Snapshot of the currently-persisted records, in insertion order.
    pub fn stored_jobs(&self) -> Vec<StoredJob> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn queue_for(state: &mut State, queue_type: &str) -> Arc<AsyncQueue<StoredJob>> {
    Arc::clone(state.queues.entry(queue_type.to_string()).or_default())
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: &StoredJob, options: InsertOptions) -> Result<(), StoreError> {
        let mut state = self.lock();
        if options.should_persist {
            state.records.push(job.clone());
        }
        queue_for(&mut state, &job.queue_type).add(job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.lock().records.retain(|job| job.id != id);
        Ok(())
    }

    fn stream(&self, queue_type: &str) -> BoxStream<'static, StoredJob> {
        let queue = queue_for(&mut self.lock(), queue_type);
        queue.stream().boxed()
    }
}
