use harvest_okta::logs::{LogsQuery, OktaLogsClient};
use harvest_okta::{Error as OktaError, OktaConfig};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::fetcher::{FetchError, FetchRequest, PageFetcher};
use crate::message::{Page, RawEvent};

pub(crate) fn new_okta_fetcher(settings: &Settings) -> Result<OktaLogsClient> {
    let mut config = OktaConfig::new(&settings.source_domain, &settings.api_key);
    config.request_timeout = settings.request_timeout;
    config.base_url = settings.source_base_url.clone();
    OktaLogsClient::new(config).map_err(|e| Error::Config(format!("okta client: {e}")))
}

impl From<OktaError> for FetchError {
    fn from(err: OktaError) -> Self {
        match err {
            OktaError::Unauthorized { .. } => FetchError::Auth(err.to_string()),
            OktaError::Unavailable { .. } | OktaError::Transport(_) => {
                FetchError::Transient(err.to_string())
            }
            OktaError::UnexpectedStatus { .. }
            | OktaError::Decode(_)
            | OktaError::InvalidConfig(_) => FetchError::MalformedResponse(err.to_string()),
        }
    }
}

impl PageFetcher for OktaLogsClient {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<Page, FetchError> {
        let page = match request.continuation.as_deref() {
            Some(next) => self.next_page(next).await?,
            None => {
                self.first_page(&LogsQuery {
                    since: request.since,
                    until: Some(request.until),
                    limit: request.limit,
                })
                .await?
            }
        };
        Ok(Page::new(
            page.events.into_iter().map(RawEvent::from).collect(),
            page.next,
        ))
    }
}
