//! Retry a fallible async [`Operation`] while a [`Condition`] allows it, cooling off between
//! attempts for the durations yielded by a [`strategy`].
//!
//! ```no_run
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! # async fn example() {
//! let result = Retry::new(
//!     fixed::Interval::from_millis(10).take(3),
//!     || async { Err::<(), &str>("unavailable") },
//!     |_: &&str| true,
//! )
//! .await;
//! assert!(result.is_err());
//! # }
//! ```

use std::future::Future;

pub mod retry;
pub mod strategy;

/// A unit of work that can be started again from scratch on every attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    /// Starts a new attempt.
    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    F: FnMut() -> T,
    T: Future<Output = Result<I, E>>,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}
