use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cursor::CursorError;
use crate::fetcher::FetchError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Fetch Error - {0}")]
    Fetch(#[from] FetchError),

    #[error(
        "Pagination limit of {max_pages} pages exceeded for window [{window_start}, {window_end})"
    )]
    PaginationLimitExceeded {
        max_pages: usize,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    },

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Cursor Error - {0}")]
    Cursor(#[from] CursorError),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Fatal errors stop the scheduler. Everything else abandons at most one window.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Cursor(_) | Error::Config(_))
    }
}
