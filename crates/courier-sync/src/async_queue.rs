//! An unbounded, multi-producer buffer consumed as an async stream.
//!
//! Values added before anyone is listening are buffered and handed out in
//! insertion order once consumption begins. The stream is not restartable:
//! there is exactly one consumer, and after it stops (drops the stream or
//! breaks out of its loop), later [`AsyncQueue::add`] calls are silently
//! discarded. That drop-after-abandon behavior is intentional; producers
//! should not need to care whether anyone is still reading.
//!
//! There is no upper bound on buffered size. Backpressure, if needed, is the
//! caller's responsibility.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

/// An unbounded multi-producer FIFO buffer with a single async consumer.
pub struct AsyncQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Appends a value. Never blocks. If the consumer has already stopped,
    /// the value is dropped.
    pub fn add(&self, value: T) {
        let _ = self.tx.send(value);
    }

    /// Takes the consumption stream. Values already added are delivered
    /// first, in insertion order.
    ///
    /// # Panics
    ///
    /// Panics if called more than once; the queue supports a single
    /// consumer.
    pub fn stream(&self) -> AsyncQueueStream<T> {
        let rx = lock(&self.rx).take();
        match rx {
            Some(rx) => AsyncQueueStream { rx },
            None => panic!("AsyncQueue::stream called twice; the queue supports a single consumer"),
        }
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The consuming half of an [`AsyncQueue`]. Ends when the queue itself is
/// dropped and the buffer has drained.
pub struct AsyncQueueStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Stream for AsyncQueueStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
