use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};

use crate::{Condition, Operation};

/// Callback invoked right before cooling off, with the error that caused the retry and the
/// delay that is about to be slept.
type Notify<E> = Box<dyn Fn(&E, Duration) + Send + Sync>;

/// A retry is either waiting on the [`Operation`] or sleeping off a backoff delay.
/// ```no_rust
///   Running --Ok--> done
///      |
///     Err --(condition false | backoff exhausted)--> done(Err)
///      |
///   Sleeping --elapsed--> Running (next attempt)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retry retries an operation based on the backoff strategy.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    notify: Option<Notify<O::Error>>,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    /// Starts the first attempt immediately. Every further attempt consumes one delay from
    /// `backoff`; when it runs dry the last error is returned.
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            notify: None,
        }
    }

    /// Registers a callback fired before every cool-off, typically used for logging.
    pub fn notify<N>(mut self, notify: N) -> Self
    where
        N: Fn(&O::Error, Duration) + Send + Sync + 'static,
    {
        self.notify = Some(Box::new(notify));
        self
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let mut this = self.as_mut().project();
            match this.state.as_mut().project() {
                RetryStateProj::Running(attempt) => {
                    let error = match ready!(attempt.poll(cx)) {
                        Ok(item) => return Poll::Ready(Ok(item)),
                        Err(error) => error,
                    };
                    if !this.condition.can_retry(&error) {
                        return Poll::Ready(Err(error));
                    }
                    let Some(delay) = this.backoff.next() else {
                        return Poll::Ready(Err(error));
                    };
                    if let Some(notify) = this.notify.as_ref() {
                        notify(&error, delay);
                    }
                    this.state.set(RetryState::Sleeping(sleep(delay)));
                }
                RetryStateProj::Sleeping(cool_off) => {
                    ready!(cool_off.poll(cx));
                    let attempt = this.operation.run();
                    this.state.set(RetryState::Running(attempt));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::fixed;

    async fn always_successful() -> Result<u64, ()> {
        Ok(42)
    }

    #[tokio::test]
    async fn successful_first_attempt() {
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            always_successful,
            |_: &()| true,
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn non_retryable_failure_returns_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), &str>("denied"))
            },
            |_: &&str| false,
        )
        .await;

        assert_eq!(result, Err("denied"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_condition_rejects() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1).take(10),
            move || {
                let previous = counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), usize>(previous + 1))
            },
            |e: &usize| *e < 3,
        )
        .await;

        assert_eq!(result, Err(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_when_backoff_is_exhausted() {
        let retries = 4;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1).take(retries),
            move || {
                let previous = counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), usize>(previous + 1))
            },
            |_: &usize| true,
        )
        .await;

        // the first run is not a retry
        assert_eq!(result, Err(retries + 1));
        assert_eq!(attempts.load(Ordering::SeqCst), retries + 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1).take(5),
            move || {
                let previous = counter.fetch_add(1, Ordering::SeqCst);
                future::ready(if previous < 2 { Err("flaky") } else { Ok(previous) })
            },
            |_: &&str| true,
        )
        .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_sees_every_cool_off() {
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notified);

        let result = Retry::new(
            fixed::Interval::from_millis(250).take(3),
            || future::ready(Err::<(), &str>("down")),
            |_: &&str| true,
        )
        .notify(move |_, delay| {
            assert_eq!(delay, Duration::from_millis(250));
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert!(result.is_err());
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }
}
