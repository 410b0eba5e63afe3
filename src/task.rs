//! Cooperative task primitives.
//!
//! The pipeline runs on a single owning thread that is driven by `tick(now)`.
//! Anything that blocks (HTTP fetches, model loading, stream decoding) runs on a
//! worker thread and hands its result back through a [`Pending`] that the owner
//! polls on a later tick. Periodic work is expressed as an [`Interval`] stored in
//! an `Option`; clearing the option cancels the schedule.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

/// Result of polling a [`Pending`].
#[derive(Debug)]
pub enum Poll<T> {
    Waiting,
    Done(Result<T>),
}

/// Handle to work that completes later.
///
/// Dropping the handle abandons the result. The worker still runs to completion
/// but its output is discarded.
pub struct Pending<T> {
    rx: Receiver<Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    /// Run `work` on a named worker thread.
    pub fn spawn<F>(name: &str, work: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Receiver may already be gone if the owner abandoned the work.
                let _ = tx.send(work());
            });
        match spawned {
            Ok(_) => Self { rx },
            Err(e) => Self::ready(Err(anyhow!("failed to spawn worker '{}': {}", name, e))),
        }
    }

    /// A handle that is already complete.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Non-blocking check for completion.
    ///
    /// Returns `Done` exactly once; polling again afterwards reports a
    /// disconnected worker.
    pub fn poll(&mut self) -> Poll<T> {
        match self.rx.try_recv() {
            Ok(result) => Poll::Done(result),
            Err(TryRecvError::Empty) => Poll::Waiting,
            Err(TryRecvError::Disconnected) => {
                Poll::Done(Err(anyhow!("worker exited without producing a result")))
            }
        }
    }

    /// Block until the work completes or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<T> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|e| anyhow!("pending work did not complete: {}", e))?
    }
}

/// Cancellable fixed-delay schedule.
///
/// An `Interval` only answers "is it due?"; the owner decides what to run and
/// calls [`Interval::reschedule`] afterwards. Store it in an `Option` and
/// `take()` it to cancel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    period: Duration,
    next_due: Instant,
}

impl Interval {
    /// First occurrence is due immediately.
    pub fn due_now(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_due: now,
        }
    }

    /// First occurrence is due one period from `now`.
    pub fn due_after(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_due: now + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Next occurrence one full period after `now`.
    pub fn reschedule(&mut self, now: Instant) {
        self.next_due = now + self.period;
    }

    /// Next occurrence after a custom delay, keeping the period.
    pub fn defer(&mut self, now: Instant, delay: Duration) {
        self.next_due = now + delay;
    }
}
