use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::message::Page;

/// [Okta System Log](https://developer.okta.com/docs/reference/api/system-log/) fetcher.
pub(crate) mod okta;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Network failures, throttling and server-side errors.
    #[error("Transient - {0}")]
    Transient(String),

    /// Credentials were rejected. Retrying will not help.
    #[error("Auth - {0}")]
    Auth(String),

    /// The page could not be understood; the window is abandoned.
    #[error("Malformed Response - {0}")]
    MalformedResponse(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// One request of a window walk. The first request of a window has no continuation and is
/// bounded by `[since, until)`; later requests only carry the continuation of the previous page.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub continuation: Option<String>,
    pub limit: u32,
}

/// Reads pages of events from the audit-log API. Implementations never retry; the poll cycle
/// owns the retry policy.
#[trait_variant::make(PageFetcher: Send)]
#[allow(dead_code)]
pub trait LocalPageFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<Page, FetchError>;
}
