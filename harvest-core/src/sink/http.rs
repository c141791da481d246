use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

use crate::error::{Error, Result};
use crate::message::NormalizedEvent;
use crate::sink::SinkWriter;

const NDJSON: &str = "application/x-ndjson";

pub(crate) struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub(crate) fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!("sink url '{url}' is not an http(s) url")));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("building http sink client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn encode(events: &[NormalizedEvent]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for event in events {
            serde_json::to_writer(&mut body, &event.to_document())
                .map_err(|e| Error::Sink(format!("encoding event: {e}")))?;
            body.push(b'\n');
        }
        Ok(body)
    }
}

impl SinkWriter for HttpSink {
    async fn write(&self, events: &[NormalizedEvent]) -> Result<()> {
        let body = Self::encode(events)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, NDJSON)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Sink(format!("posting to {}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Sink(format!("{} responded with {status}", self.url)));
        }
        Ok(())
    }
}
