use std::time::Duration;

/// Yields the same delay forever. Bound it with [`Iterator::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    delay: Duration,
}

impl Interval {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl From<Duration> for Interval {
    fn from(delay: Duration) -> Self {
        Self::new(delay)
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.delay)
    }
}
