//! A task runner that coalesces pending work down to the most recent task.
//!
//! Many jobs amount to "recompute the current derived state": running every
//! intermediate version is wasted work because only the final state matters.
//! While a task executes, this queue keeps only the most recently added
//! successor; superseded tasks are dropped without ever running.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type EmptyCallback = Box<dyn FnOnce() + Send + 'static>;

/// A coalescing task runner.
#[derive(Clone, Default)]
pub struct LatestQueue {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    running: bool,
    pending: Option<Task>,
    once_empty: Vec<EmptyCallback>,
}

impl LatestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task`. If the queue is idle it starts immediately;
    /// otherwise it replaces whatever was pending, so intermediate tasks
    /// added while another is running never execute.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let first: Task = {
            let mut state = self.lock();
            if state.running {
                state.pending = Some(Box::pin(task));
                return;
            }
            state.running = true;
            Box::pin(task)
        };
        self.spawn_runner(first);
    }

    /// Registers a callback fired once when no task is running and none is
    /// pending. Fires immediately if the queue is already empty.
    pub fn once_empty<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            if state.running || state.pending.is_some() {
                state.once_empty.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_runner(&self, first: Task) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut current = Some(first);
            while let Some(task) = current.take() {
                task.await;

                let mut guard = match state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                current = guard.pending.take();
                if current.is_none() {
                    guard.running = false;
                    let callbacks = std::mem::take(&mut guard.once_empty);
                    drop(guard);
                    for callback in callbacks {
                        callback();
                    }
                }
            }
        });
    }
}
