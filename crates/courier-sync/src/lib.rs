//! Concurrency primitives for the Courier job runtime.
//!
//! This crate provides the small building blocks the job queues are
//! assembled from:
//!
//! - [`AsyncQueue`]: an unbounded, multi-producer buffer consumed once as an
//!   async stream.
//! - [`LatestQueue`]: a task runner that coalesces pending work down to the
//!   most recently added task.
//! - [`Sleeper`]: sleeps that can be woken early by a broadcast
//!   [`JobCancelReason`], so shutdown and power transitions never hang on a
//!   timer.

pub mod async_queue;
pub mod latest_queue;
pub mod sleeper;

pub use async_queue::{AsyncQueue, AsyncQueueStream};
pub use latest_queue::LatestQueue;
pub use sleeper::{JobCancelReason, SleepOptions, SleepOutcome, Sleeper};
