//! Strategies are plain iterators of [`std::time::Duration`]; each item is the delay before the
//! next attempt, and the end of the iterator ends the retries.

pub mod exponential;
pub mod fixed;
