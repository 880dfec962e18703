//! Durable outbound job processing for Courier.
//!
//! This crate is the core that schedules, persists, retries, and
//! rate-limits per-conversation work (message sends, receipts, pin
//! operations). Jobs are persisted before they run and deleted only once
//! they reach a terminal state, so a crash re-delivers anything in flight:
//! at-least-once local execution, with job bodies written to tolerate
//! re-execution. Per conversation, at most one job is active at a time and
//! jobs run in enqueue order.
//!
//! The pieces:
//!
//! - [`queue::JobQueue`] — the runtime: persistence, streaming, per-key
//!   serialization, and the retry budget.
//! - [`store::JobStore`] — the persistence seam, with an in-memory
//!   implementation (and a SQLite one behind the `sqlite` feature).
//! - [`retry`] — classification of request failures and backoff pacing.
//! - [`conversation`] — the `"conversation"` queue: receipts, pins, and
//!   unpins with recipient validation and group-failure classification.
//! - [`single_proto`] — the `"single-proto"` queue for saved protobuf
//!   payloads.

pub mod conversation;
pub mod error;
pub mod job;
pub mod queue;
pub mod retry;
pub mod single_proto;
pub mod store;

pub use error::{
    BoxError, HttpError, JobError, ProtoSendError, QueueError, RecipientError, SendError,
    StoreError,
};
pub use job::{Completion, Job, ParsedJob, StoredJob};
pub use queue::{JobQueue, JobQueueOptions, JobRunContext, JobRunner};
pub use store::memory::InMemoryStore;
pub use store::{InsertOptions, JobStore};
