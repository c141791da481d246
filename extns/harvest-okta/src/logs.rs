use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, LINK};
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use crate::{Error, OktaConfig, Result, link};

const LOGS_PATH: &str = "/api/v1/logs";

/// Parameters of the first request of a window. Follow-up pages are requested through the
/// `next` URL of the previous page.
#[derive(Debug, Clone, PartialEq)]
pub struct LogsQuery {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// One page of System Log events in the order Okta returned them.
#[derive(Debug, Clone, Default)]
pub struct LogsPage {
    pub events: Vec<Value>,
    /// URL of the next page. `None` once the query is exhausted.
    pub next: Option<String>,
}

#[derive(Clone)]
pub struct OktaLogsClient {
    http: Client,
    base_url: String,
    origin: Url,
}

impl OktaLogsClient {
    pub fn new(config: OktaConfig) -> Result<Self> {
        config.validate()?;

        let mut auth = HeaderValue::from_str(&format!("SSWS {}", config.api_key))
            .map_err(|e| Error::InvalidConfig(format!("api key is not a valid header: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("building http client: {e}")))?;

        let base_url = config.base_url();
        let origin = Url::parse(&base_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid base url {base_url}: {e}")))?;

        Ok(Self {
            http,
            base_url,
            origin,
        })
    }

    /// Fetches the first page of events published in `[since, until)`, oldest first.
    pub async fn first_page(&self, query: &LogsQuery) -> Result<LogsPage> {
        let mut params = vec![
            ("since", format_time(query.since)),
            ("limit", query.limit.to_string()),
            ("sortOrder", "ASCENDING".to_string()),
        ];
        if let Some(until) = query.until {
            params.push(("until", format_time(until)));
        }

        let url = format!("{}{LOGS_PATH}", self.base_url);
        debug!(%url, ?params, "Requesting first System Log page");
        let response = self
            .http
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(transport_error)?;
        self.read_page(response).await
    }

    /// Fetches the page behind a `next` URL returned by a previous call.
    pub async fn next_page(&self, next: &str) -> Result<LogsPage> {
        // the token goes out with every request, never follow links to another origin
        if !self.same_origin(next) {
            return Err(Error::Decode(format!(
                "next link {next} does not belong to {}",
                self.base_url
            )));
        }
        debug!(url = next, "Requesting next System Log page");
        let response = self
            .http
            .get(next)
            .send()
            .await
            .map_err(transport_error)?;
        self.read_page(response).await
    }

    fn same_origin(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|url| {
            url.scheme() == self.origin.scheme()
                && url.host_str() == self.origin.host_str()
                && url.port_or_known_default() == self.origin.port_or_known_default()
        })
    }

    async fn read_page(&self, response: Response) -> Result<LogsPage> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let next = link::next_link(
            response
                .headers()
                .get_all(LINK)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );

        let body = response.bytes().await.map_err(transport_error)?;
        let events = match serde_json::from_slice::<Value>(&body)
            .map_err(|e| Error::Decode(format!("System Log response is not JSON: {e}")))?
        {
            Value::Array(events) => events,
            other => {
                return Err(Error::Decode(format!(
                    "expected an array of events, got {}",
                    json_kind(&other)
                )));
            }
        };

        // polling queries keep returning a next link even when caught up
        let next = if events.is_empty() { None } else { next };
        Ok(LogsPage { events, next })
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::Transport(err.to_string())
}

fn status_error(status: StatusCode, body: String) -> Error {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Unauthorized { status: code, body }
        }
        StatusCode::TOO_MANY_REQUESTS => Error::Unavailable { status: code, body },
        s if s.is_server_error() => Error::Unavailable { status: code, body },
        _ => Error::UnexpectedStatus { status: code, body },
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
