//! Single-slot producer/consumer handoff.
//!
//! `Handoff` holds at most one value. `put` sleeps while the slot is full
//! and `take` sleeps while it is empty; both wake on a condition variable
//! rather than polling the lock. `close` cancels every waiter.

use crate::config::HandoffConfig;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Returned by `put` on a closed handoff, carrying back the value.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

/// Returned by `take` once the handoff is closed and drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

/// A blocking rendezvous slot shared between one producer and one consumer.
pub struct Handoff<T> {
    slot: Mutex<Slot<T>>,
    filled: Condvar,
    emptied: Condvar,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            filled: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    // The slot holds no invariant a panicking holder could break halfway.
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the slot to be empty, then fill it.
    pub fn put(&self, value: T) -> Result<(), Closed<T>> {
        let guard = self.lock();
        let mut slot = self
            .emptied
            .wait_while(guard, |s| s.value.is_some() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if slot.closed {
            return Err(Closed(value));
        }
        slot.value = Some(value);
        drop(slot);
        self.filled.notify_one();
        Ok(())
    }

    /// Wait for a value and take it.
    ///
    /// A value put before `close` is still delivered; after that, `Drained`.
    pub fn take(&self) -> Result<T, Drained> {
        let guard = self.lock();
        let mut slot = self
            .filled
            .wait_while(guard, |s| s.value.is_none() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        let value = slot.value.take().ok_or(Drained)?;
        drop(slot);
        self.emptied.notify_one();
        Ok(value)
    }

    /// Take the value if one is waiting, without blocking.
    pub fn try_take(&self) -> Option<T> {
        let value = self.lock().value.take();
        if value.is_some() {
            self.emptied.notify_one();
        }
        value
    }

    /// Refuse further values and wake everyone waiting.
    pub fn close(&self) {
        self.lock().closed = true;
        self.filled.notify_all();
        self.emptied.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Closes the handoff when dropped, so a consumer that unwinds never
/// leaves the producer blocked.
struct CloseOnDrop<T>(Arc<Handoff<T>>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Errors from the handoff demo.
#[derive(Debug)]
pub enum HandoffError {
    Spawn(io::Error),
    /// The consumer stopped before taking every value.
    ConsumerGone { produced: usize },
    ConsumerPanicked,
}

impl std::fmt::Display for HandoffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffError::Spawn(e) => write!(f, "Failed to spawn consumer thread: {e}"),
            HandoffError::ConsumerGone { produced } => {
                write!(f, "Consumer went away after {produced} values")
            }
            HandoffError::ConsumerPanicked => write!(f, "Consumer thread panicked"),
        }
    }
}

impl std::error::Error for HandoffError {}

/// Why the consumer closed the handoff before every value was produced.
fn stopped_early<R>(consumer: JoinHandle<R>, produced: usize) -> HandoffError {
    match consumer.join() {
        Ok(_) => HandoffError::ConsumerGone { produced },
        Err(_) => HandoffError::ConsumerPanicked,
    }
}

/// Pass `0..count` from this thread to a consumer thread, one at a time.
///
/// Returns the values in the order the consumer received them.
pub fn run_demo(config: &HandoffConfig) -> Result<Vec<usize>, HandoffError> {
    let handoff = Arc::new(Handoff::new());
    let delay = Duration::from_millis(config.consumer_delay_ms);

    info!(count = config.count, delay_ms = config.consumer_delay_ms, "Starting handoff demo");

    let consumer = {
        let guard = CloseOnDrop(Arc::clone(&handoff));
        thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || {
                let mut consumed = Vec::new();
                while let Ok(value) = guard.0.take() {
                    thread::sleep(delay);
                    println!("Consumer has consumed: {value}");
                    consumed.push(value);
                }
                debug!(consumed = consumed.len(), "Consumer finished");
                consumed
            })
            .map_err(HandoffError::Spawn)?
    };

    for i in 0..config.count {
        if handoff.put(i).is_err() {
            return Err(stopped_early(consumer, i));
        }
        println!("Producer has produced: {i}");
    }
    handoff.close();

    let consumed = consumer.join().map_err(|_| HandoffError::ConsumerPanicked)?;
    info!(consumed = consumed.len(), "Handoff demo finished");
    Ok(consumed)
}
