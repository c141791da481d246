//! The harvest watermark: every event published strictly before it has been accepted by the sink.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CursorError {
    #[error("cursor cannot move back from {current} to {requested}")]
    Regression {
        current: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    watermark: DateTime<Utc>,
}

impl Cursor {
    pub fn new(watermark: DateTime<Utc>) -> Self {
        Self { watermark }
    }

    /// Picks the starting watermark: a saved checkpoint wins over a configured start time,
    /// which wins over `now - lookback`.
    pub fn resolve(
        checkpoint: Option<DateTime<Utc>>,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Self {
        let watermark = checkpoint.or(start_time).unwrap_or_else(|| {
            let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::MAX);
            now.checked_sub_signed(lookback)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        Self::new(watermark)
    }

    pub fn value(&self) -> DateTime<Utc> {
        self.watermark
    }

    /// Moves the watermark forward. Moving it back is a caller bug and is refused.
    pub fn advance_to(&mut self, watermark: DateTime<Utc>) -> Result<(), CursorError> {
        if watermark < self.watermark {
            return Err(CursorError::Regression {
                current: self.watermark,
                requested: watermark,
            });
        }
        self.watermark = watermark;
        Ok(())
    }
}
