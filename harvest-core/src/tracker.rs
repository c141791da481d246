//! Tracks events that were handed to the sink but not yet acknowledged, so shutdown can wait for
//! the sink to drain before the process exits.
//!
//! [InFlightCounter] is two monotonic counters: `added` grows right before an event is submitted,
//! `completed` grows when the sink reports the event as delivered or abandoned. Their difference
//! is what is still in flight. [ShutdownCoordinator] waits for that difference to reach zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Counts {
    added: AtomicU64,
    completed: AtomicU64,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct InFlightCounter {
    inner: Arc<Counts>,
}

impl InFlightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called right before the event is submitted to the sink.
    pub fn add(&self) {
        self.inner.added.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks `n` events as acknowledged (delivered or permanently abandoned).
    pub fn complete(&self, n: u64) {
        self.inner.completed.fetch_add(n, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn added(&self) -> u64 {
        self.inner.added.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> u64 {
        // completed can only catch up with added, read it last
        let added = self.added();
        added.saturating_sub(self.completed())
    }

    async fn drained(&self) {
        self.wait_until(|| self.pending() == 0).await
    }

    /// Resolves once at least `n` events were acknowledged.
    pub async fn completed_at_least(&self, n: u64) {
        self.wait_until(|| self.completed() >= n).await
    }

    async fn wait_until(&self, done: impl Fn() -> bool) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a completion in between is not missed
            notified.as_mut().enable();
            if done() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { pending: u64 },
}

/// Gates process exit on the sink acknowledging everything that was submitted.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    counter: InFlightCounter,
}

impl ShutdownCoordinator {
    pub fn new(counter: InFlightCounter) -> Self {
        Self { counter }
    }

    pub fn on_acknowledged(&self) {
        self.counter.complete(1);
    }

    /// Waits until every submitted event is acknowledged. `None` waits indefinitely, a zero
    /// timeout only reports the current state.
    pub async fn wait(&self, timeout: Option<Duration>) -> DrainOutcome {
        match timeout {
            None => {
                self.counter.drained().await;
                DrainOutcome::Drained
            }
            Some(timeout) => match tokio::time::timeout(timeout, self.counter.drained()).await {
                Ok(()) => DrainOutcome::Drained,
                Err(_) => DrainOutcome::TimedOut {
                    pending: self.counter.pending(),
                },
            },
        }
    }
}
