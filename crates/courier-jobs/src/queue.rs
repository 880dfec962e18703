//! The job runtime: persists jobs, streams them back (including across
//! restarts), serializes execution per queue key, and applies the retry
//! budget.
//!
//! A [`JobQueue`] pairs a [`JobStore`] with a [`JobRunner`]. Enqueued work
//! is persisted before anything runs; the store's stream is the only path
//! into execution, so jobs recovered after a crash and jobs added a moment
//! ago travel the same road. Per queue key, at most one job is active at a
//! time and jobs run in insertion order; across keys, execution is bounded
//! only by the queue's concurrency limit.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

use courier_sync::{JobCancelReason, Sleeper};

use crate::error::{BoxError, JobError, QueueError, StoreError};
use crate::job::{Completion, Job, ParsedJob, StoredJob};
use crate::retry::exponential_backoff_max_attempts;
use crate::store::{InsertOptions, JobStore};

const DEFAULT_MAX_RETRY_TIME: Duration = Duration::from_secs(24 * 60 * 60);

const PARSE_FAILURE_MESSAGE: &str =
    "Failed to parse job data. Was unexpected data loaded from the database?";

/// Defines one queue type's behavior: how payloads decode, how jobs
/// partition into serial lanes, and what running one attempt means.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Tag identifying which stored jobs this runner consumes.
    fn queue_type(&self) -> &'static str;

    /// Decodes a stored payload. Failures are terminal: the stored record
    /// is deleted and the job's completion rejects without the body ever
    /// running.
    fn parse_data(&self, data: &serde_json::Value) -> Result<Self::Data, BoxError> {
        serde_json::from_value(data.clone()).map_err(Into::into)
    }

    /// Serialization key: at most one job per key is active at a time, and
    /// jobs for one key run in insertion order. Defaults to a single shared
    /// lane.
    fn queue_key(&self, _data: &Self::Data) -> String {
        "default".to_string()
    }

    /// One execution attempt. An `Err` re-enters the retry loop until the
    /// attempt or time budget runs out.
    async fn run(&self, job: &ParsedJob<Self::Data>, ctx: &JobRunContext) -> Result<(), BoxError>;
}

/// Everything a job body can consult about the attempt in flight.
pub struct JobRunContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Whether a failure of this attempt is terminal.
    pub is_final_attempt: bool,
    /// Wall-clock budget left, measured from the job's creation timestamp.
    pub time_remaining: Duration,
    /// The job's creation timestamp.
    pub timestamp: DateTime<Utc>,
    /// Sleeper shared with the queue; every wait in a job body should go
    /// through it so cancellation reaches the body.
    pub sleeper: Sleeper,
    shutting_down: Arc<AtomicBool>,
}

impl JobRunContext {
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Tunables for one queue. The retry time budget is explicit so tests (and
/// queue types with different tolerances) can shrink it.
#[derive(Debug, Clone)]
pub struct JobQueueOptions {
    /// Hard wall-clock budget measured from the job's creation timestamp;
    /// once spent, the next failure is terminal.
    pub max_retry_time: Duration,
    /// Attempt cap. Defaults to the number of backoff steps that fit the
    /// time budget.
    pub max_attempts: u32,
    /// How many jobs (across different keys) may run at once.
    pub max_concurrency: usize,
}

impl JobQueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retry_time(mut self, value: Duration) -> Self {
        self.max_retry_time = value;
        self
    }

    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }

    pub fn max_concurrency(mut self, value: usize) -> Self {
        self.max_concurrency = value;
        self
    }
}

impl Default for JobQueueOptions {
    fn default() -> Self {
        Self {
            max_retry_time: DEFAULT_MAX_RETRY_TIME,
            max_attempts: exponential_backoff_max_attempts(DEFAULT_MAX_RETRY_TIME),
            max_concurrency: 16,
        }
    }
}

/// Durable queue runtime for one queue type.
///
/// Construct it with a store and a [`JobRunner`], spawn [`stream_jobs`] once
/// to begin consuming (which re-delivers records persisted by a previous
/// process), and [`add`] work from anywhere. Cloning yields another handle
/// to the same queue.
///
/// [`stream_jobs`]: JobQueue::stream_jobs
/// [`add`]: JobQueue::add
pub struct JobQueue<R: JobRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: JobRunner> Clone for JobQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<R: JobRunner> {
    runner: R,
    store: Arc<dyn JobStore>,
    options: JobQueueOptions,
    lanes: Lanes,
    sleeper: Sleeper,
    completions: Mutex<HashMap<String, oneshot::Sender<Result<(), JobError>>>>,
    streaming: AtomicBool,
    shutting_down: Arc<AtomicBool>,
}

impl<R: JobRunner> JobQueue<R> {
    pub fn new<S: JobStore + 'static>(store: S, runner: R) -> Self {
        Self::with_options(store, runner, JobQueueOptions::default())
    }

    pub fn with_options<S: JobStore + 'static>(
        store: S,
        runner: R,
        options: JobQueueOptions,
    ) -> Self {
        let lanes = Lanes::new(options.max_concurrency);
        Self {
            inner: Arc::new(Inner {
                runner,
                store: Arc::new(store),
                options,
                lanes,
                sleeper: Sleeper::new(),
                completions: Mutex::new(HashMap::new()),
                streaming: AtomicBool::new(false),
                shutting_down: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn queue_type(&self) -> &'static str {
        self.inner.runner.queue_type()
    }

    /// The sleeper every wait in this queue goes through. Applications wire
    /// OS power-monitor events to it via [`Sleeper::cancel_all`].
    pub fn sleeper(&self) -> &Sleeper {
        &self.inner.sleeper
    }

    /// Persists a job and hands back its record, completion handle
    /// included. The job only starts once the store's stream delivers it.
    pub async fn add(&self, data: R::Data) -> Result<Job<R::Data>, QueueError> {
        self.add_with_options(data, InsertOptions::default()).await
    }

    /// Like [`add`](JobQueue::add), with `should_persist: false` available
    /// for work whose loss on restart is acceptable.
    pub async fn add_with_options(
        &self,
        data: R::Data,
        options: InsertOptions,
    ) -> Result<Job<R::Data>, QueueError> {
        let stored = StoredJob {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            queue_type: self.inner.runner.queue_type().to_string(),
            data: serde_json::to_value(&data).map_err(StoreError::from)?,
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.completions).insert(stored.id.clone(), tx);

        if let Err(error) = self.inner.store.insert(&stored, options).await {
            lock(&self.inner.completions).remove(&stored.id);
            return Err(error.into());
        }

        tracing::info!(
            queue_type = self.queue_type(),
            job_id = %stored.id,
            "job added"
        );

        Ok(Job {
            id: stored.id,
            timestamp: stored.timestamp,
            queue_type: stored.queue_type,
            data,
            completion: Completion::new(rx),
        })
    }

    /// Consumes the store's stream for this queue type until the store goes
    /// away, enqueueing every delivered job. May only be called once; the
    /// runtime owns the single consumer seat.
    pub async fn stream_jobs(&self) -> Result<(), QueueError> {
        if self.inner.streaming.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStreaming);
        }

        tracing::info!(queue_type = self.queue_type(), "streaming jobs");
        let mut stream = self.inner.store.stream(self.inner.runner.queue_type());
        while let Some(stored) = stream.next().await {
            self.enqueue_stored_job(stored);
        }
        Ok(())
    }

    /// Stops progress for shutdown-class reasons and wakes matching sleeps.
    /// In-flight jobs halt at their next checkpoint; their stored records
    /// are left in place so a later process re-delivers them, and their
    /// completions never settle.
    pub fn cancel_all(&self, reason: JobCancelReason) {
        if matches!(
            reason,
            JobCancelReason::Shutdown | JobCancelReason::JobManagerStopped
        ) {
            self.inner.shutting_down.store(true, Ordering::SeqCst);
        }
        self.inner.sleeper.cancel_all(reason);
    }

    /// Equivalent to `cancel_all(JobCancelReason::Shutdown)`.
    pub fn shutdown(&self) {
        self.cancel_all(JobCancelReason::Shutdown);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    fn enqueue_stored_job(&self, stored: StoredJob) {
        if stored.queue_type != self.inner.runner.queue_type() {
            tracing::warn!(
                expected = self.inner.runner.queue_type(),
                got = %stored.queue_type,
                job_id = %stored.id,
                "dropping job streamed to the wrong queue"
            );
            return;
        }

        let data = match self.inner.runner.parse_data(&stored.data) {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(
                    queue_type = %stored.queue_type,
                    job_id = %stored.id,
                    error = %error,
                    "failed to parse job data"
                );
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.delete_stored(&stored.id).await;
                    inner.settle(
                        &stored.id,
                        Err(JobError::new(format!("{PARSE_FAILURE_MESSAGE} {error}"))),
                    );
                });
                return;
            }
        };

        let key = self.inner.runner.queue_key(&data);
        let parsed = ParsedJob {
            id: stored.id,
            timestamp: stored.timestamp,
            queue_type: stored.queue_type,
            data,
        };

        let inner = Arc::clone(&self.inner);
        self.inner.lanes.add(
            &key,
            Box::pin(async move {
                inner.run_job(parsed).await;
            }),
        );
    }
}

enum Outcome {
    Success,
    Failed(JobError),
    Cancelled,
}

impl<R: JobRunner> Inner<R> {
    async fn run_job(self: Arc<Self>, job: ParsedJob<R::Data>) {
        let span = tracing::info_span!(
            "job",
            queue_type = %job.queue_type,
            job_id = %job.id
        );
        self.run_job_inner(&job).instrument(span).await;
    }

    async fn run_job_inner(&self, job: &ParsedJob<R::Data>) {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;

        let outcome = loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break Outcome::Cancelled;
            }

            attempt += 1;
            let is_final_attempt = attempt >= max_attempts;
            let time_remaining = remaining_time(job.timestamp, self.options.max_retry_time);
            let ctx = JobRunContext {
                attempt,
                is_final_attempt,
                time_remaining,
                timestamp: job.timestamp,
                sleeper: self.sleeper.clone(),
                shutting_down: Arc::clone(&self.shutting_down),
            };

            match self.runner.run(job, &ctx).await {
                Ok(()) => break Outcome::Success,
                Err(error) => {
                    tracing::warn!(attempt, max_attempts, error = %error, "job attempt failed");
                    if is_final_attempt || time_remaining.is_zero() {
                        break Outcome::Failed(JobError::new(error));
                    }
                }
            }
        };

        match outcome {
            Outcome::Success => {
                self.delete_stored(&job.id).await;
                tracing::info!(attempt, "job completed");
                self.settle(&job.id, Ok(()));
            }
            Outcome::Failed(error) => {
                self.delete_stored(&job.id).await;
                tracing::error!(attempt, error = %error, "job failed permanently");
                self.settle(&job.id, Err(error));
            }
            Outcome::Cancelled => {
                tracing::info!("job cancelled; leaving stored record for recovery");
                // Dropping the sender leaves the completion unsettled, which
                // is what cancellation means.
                lock(&self.completions).remove(&job.id);
            }
        }
    }

    async fn delete_stored(&self, id: &str) {
        if let Err(error) = self.store.delete(id).await {
            tracing::error!(job_id = %id, error = %error, "failed to delete stored job");
        }
    }

    fn settle(&self, job_id: &str, result: Result<(), JobError>) {
        let sender = lock(&self.completions).remove(job_id);
        match sender {
            // The enqueuer may have dropped its handle; that is fine.
            Some(sender) => {
                let _ = sender.send(result);
            }
            // Jobs recovered from a previous process have no local handle.
            None => {
                if let Err(error) = result {
                    tracing::error!(job_id, error = %error, "recovered job failed permanently");
                }
            }
        }
    }
}

fn remaining_time(timestamp: DateTime<Utc>, max_retry_time: Duration) -> Duration {
    let elapsed = (Utc::now() - timestamp).to_std().unwrap_or(Duration::ZERO);
    max_retry_time.saturating_sub(elapsed)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type LaneTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Per-key serial lanes. Each key gets a lane draining its tasks in FIFO
/// order under the shared concurrency limit; a lane that runs dry removes
/// itself.
struct Lanes {
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<LaneTask>>>>,
    permits: Arc<Semaphore>,
}

impl Lanes {
    fn new(max_concurrency: usize) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    fn add(&self, key: &str, task: LaneTask) {
        let mut lanes = lock(&self.lanes);
        let task = match lanes.get(key) {
            Some(tx) => match tx.send(task) {
                Ok(()) => return,
                // The drainer went away with its entry still in the map;
                // take the task back and start a fresh lane.
                Err(mpsc::error::SendError(task)) => task,
            },
            None => task,
        };
        self.start_lane(&mut lanes, key, task);
    }

    fn start_lane(
        &self,
        lanes: &mut HashMap<String, mpsc::UnboundedSender<LaneTask>>,
        key: &str,
        task: LaneTask,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(task);
        lanes.insert(key.to_string(), tx);
        self.spawn_drainer(key.to_string(), rx);
    }

    fn spawn_drainer(&self, key: String, mut rx: mpsc::UnboundedReceiver<LaneTask>) {
        let lanes = Arc::clone(&self.lanes);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            loop {
                // Removal and the emptiness check happen under the same lock
                // used by `add`, so a task is either drained here or lands
                // in a fresh lane.
                let task = {
                    let mut lanes = lock(&lanes);
                    match rx.try_recv() {
                        Ok(task) => task,
                        Err(_) => {
                            lanes.remove(&key);
                            break;
                        }
                    }
                };

                let permit = match permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                task.await;
                drop(permit);
            }
        });
    }
}
