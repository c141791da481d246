//! Client for the Okta [System Log API].
//!
//! Only the read path is implemented: one request returns one page of log events and, when more
//! data exists, the URL of the next page taken from the `Link` response header. The client never
//! retries; callers decide what to do with [`Error::is_retryable`] errors.
//!
//! [System Log API]: https://developer.okta.com/docs/reference/api/system-log/

use std::time::Duration;

pub mod logs;

mod link;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Okta rejected the API token ({status}) - {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Okta is unavailable ({status}) - {body}")]
    Unavailable { status: u16, body: String },

    #[error("Transport - {0}")]
    Transport(String),

    #[error("Unexpected response status {status} - {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Decoding response - {0}")]
    Decode(String),
}

impl Error {
    /// Errors that may go away on their own: throttling, server-side failures and transport
    /// problems.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable { .. } | Error::Transport(_))
    }
}

/// Connection settings for an Okta org.
#[derive(Debug, Clone, PartialEq)]
pub struct OktaConfig {
    /// Org domain, e.g. `acme.okta.com`.
    pub domain: String,
    pub api_key: String,
    pub request_timeout: Duration,
    /// Overrides `https://{domain}`; used to point the client at a local server.
    pub base_url: Option<String>,
}

impl OktaConfig {
    pub fn new(domain: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
            base_url: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_none() && self.domain.trim().is_empty() {
            return Err(Error::InvalidConfig("domain must not be empty".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::InvalidConfig("api key must not be empty".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.domain.trim_end_matches('/')),
        }
    }
}
