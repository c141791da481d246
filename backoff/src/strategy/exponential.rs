use std::time::Duration;

use rand::Rng;

/// Delays that grow by `factor` on every attempt, capped at `max_delay`, optionally spread by
/// `jitter` (0.0..=1.0) to avoid synchronized retries.
///
/// The n-th delay (1-based) is `base_delay * factor^(n - 1)` before jitter and capping.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::from_millis(100, 1_000, 2.0).take(5).collect();
/// assert_eq!(delays[0], Duration::from_millis(100));
/// assert_eq!(delays[4], Duration::from_millis(1_000));
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(base_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            factor,
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_delay_ms: u64, max_delay_ms: u64, factor: f64) -> Self {
        Self::new(
            Duration::from_millis(base_delay_ms),
            Duration::from_millis(max_delay_ms),
            factor,
        )
    }

    /// Randomizes each delay within `[1 - jitter, 1 + jitter]` of its nominal value.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Stops yielding delays after `max_attempts` retries.
    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u16) -> Duration {
        let exponent = i32::from(attempt.saturating_sub(1));
        let nominal_ms = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let spread = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        let delay_ms = (nominal_ms * spread).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }
}
