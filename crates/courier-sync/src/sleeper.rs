//! Sleeps that cooperate with shutdown and power-state transitions.
//!
//! Every long wait in the job runtime goes through a [`Sleeper`], so that a
//! single broadcast can wake them all instead of leaving the process
//! blocked on timers. Each wake carries a [`JobCancelReason`] letting the
//! woken code distinguish "the user cancelled this" from "the process is
//! exiting" from "the machine just suspended".

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

/// Why a sleep (or the work waiting on it) was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCancelReason {
    UserInitiated,
    Shutdown,
    JobManagerStopped,
    PowerMonitorSuspend,
    PowerMonitorResume,
}

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration elapsed.
    Elapsed,
    /// A broadcast woke the sleep before the duration elapsed.
    Cancelled(JobCancelReason),
}

impl SleepOutcome {
    pub fn was_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Options for a single sleep.
#[derive(Debug, Clone, Copy)]
pub struct SleepOptions {
    /// When `true` (the default), a process-shutdown broadcast resolves the
    /// sleep immediately so it cannot block exit. Waits that must not be cut
    /// short by shutdown (e.g. loops that would otherwise spin) set this to
    /// `false`.
    pub resolve_on_shutdown: bool,
}

impl Default for SleepOptions {
    fn default() -> Self {
        Self {
            resolve_on_shutdown: true,
        }
    }
}

/// A shared handle that hands out cancellable sleeps.
#[derive(Clone)]
pub struct Sleeper {
    inner: Arc<Inner>,
}

struct Inner {
    cancels: broadcast::Sender<JobCancelReason>,
    shut_down: AtomicBool,
    active: AtomicUsize,
}

impl Sleeper {
    pub fn new() -> Self {
        let (cancels, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                cancels,
                shut_down: AtomicBool::new(false),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Sleeps for `duration`, or until a matching cancellation is broadcast.
    /// `reason` names the caller in logs.
    pub async fn sleep(
        &self,
        duration: Duration,
        reason: &str,
        options: SleepOptions,
    ) -> SleepOutcome {
        if options.resolve_on_shutdown && self.is_shut_down() {
            return SleepOutcome::Cancelled(JobCancelReason::Shutdown);
        }

        let mut cancels = self.inner.cancels.subscribe();
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(reason, duration_ms = duration.as_millis() as u64, "sleeping");

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        let outcome = loop {
            tokio::select! {
                _ = &mut sleep => break SleepOutcome::Elapsed,
                cancel = cancels.recv() => match cancel {
                    Ok(JobCancelReason::Shutdown) if !options.resolve_on_shutdown => continue,
                    Ok(cancel) => break SleepOutcome::Cancelled(cancel),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        sleep.as_mut().await;
                        break SleepOutcome::Elapsed;
                    }
                },
            }
        };

        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if let SleepOutcome::Cancelled(cancel) = outcome {
            tracing::debug!(reason, ?cancel, "sleep cancelled");
        }
        outcome
    }

    /// Wakes every active sleep that matches `reason`. A [`Shutdown`]
    /// broadcast skips sleeps flagged `resolve_on_shutdown: false`, and
    /// additionally makes future shutdown-resolvable sleeps return
    /// immediately.
    ///
    /// [`Shutdown`]: JobCancelReason::Shutdown
    pub fn cancel_all(&self, reason: JobCancelReason) {
        if reason == JobCancelReason::Shutdown {
            self.inner.shut_down.store(true, Ordering::SeqCst);
        }
        let active = self.inner.active.load(Ordering::SeqCst);
        tracing::info!(?reason, active_sleeps = active, "waking active sleeps");
        let _ = self.inner.cancels.send(reason);
    }

    /// Equivalent to `cancel_all(JobCancelReason::Shutdown)`.
    pub fn shutdown(&self) {
        self.cancel_all(JobCancelReason::Shutdown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for Sleeper {
    fn default() -> Self {
        Self::new()
    }
}
