//! Fakes shared by the poll cycle and scheduler tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::{FetchError, FetchRequest, PageFetcher};
use crate::message::{NormalizedEvent, Page, RawEvent};
use crate::poller::Clock;
use crate::sink::Sink;
use crate::tracker::InFlightCounter;

pub(crate) fn ts(minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, second).unwrap()
}

/// An Okta-shaped record.
pub(crate) fn raw(id: &str, published: DateTime<Utc>) -> RawEvent {
    RawEvent::from(json!({
        "uuid": id,
        "published": published.to_rfc3339(),
        "eventType": "user.session.start",
    }))
}

pub(crate) fn page(events: Vec<RawEvent>, continuation: Option<&str>) -> Page {
    Page::new(events, continuation.map(str::to_string))
}

/// Serves scripted responses in order and records every request. Once the script runs out it
/// answers with an empty last page.
#[derive(Clone, Default)]
pub(crate) struct ScriptedFetcher {
    script: Arc<Mutex<VecDeque<std::result::Result<Page, FetchError>>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
    delay: Option<Duration>,
    /// Cancels the token while serving the n-th request (1-based).
    cancel_on: Option<(usize, CancellationToken)>,
}

impl ScriptedFetcher {
    pub(crate) fn new(
        script: impl IntoIterator<Item = std::result::Result<Page, FetchError>>,
    ) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            ..Default::default()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn cancel_on(mut self, request: usize, token: CancellationToken) -> Self {
        self.cancel_on = Some((request, token));
        self
    }

    pub(crate) fn push(&self, response: std::result::Result<Page, FetchError>) {
        self.script.lock().push_back(response);
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, request: FetchRequest) -> std::result::Result<Page, FetchError> {
        let served = {
            let mut requests = self.requests.lock();
            requests.push(request);
            requests.len()
        };
        if let Some((n, token)) = &self.cancel_on {
            if *n == served {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(Page::default()))
    }
}

/// Records submitted events. Acknowledges on submit unless told otherwise; can be made to refuse
/// submissions after a number of accepted events.
#[derive(Clone)]
pub(crate) struct RecordingSink {
    events: Arc<Mutex<Vec<NormalizedEvent>>>,
    counter: InFlightCounter,
    acknowledge: bool,
    accept_limit: Option<usize>,
}

impl RecordingSink {
    pub(crate) fn new(counter: InFlightCounter) -> Self {
        Self {
            events: Arc::default(),
            counter,
            acknowledge: true,
            accept_limit: None,
        }
    }

    pub(crate) fn without_acks(mut self) -> Self {
        self.acknowledge = false;
        self
    }

    pub(crate) fn accept_limit(mut self, limit: usize) -> Self {
        self.accept_limit = Some(limit);
        self
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| event.id.clone())
            .collect()
    }
}

impl Sink for RecordingSink {
    async fn submit(&mut self, event: NormalizedEvent) -> Result<()> {
        let mut events = self.events.lock();
        if self.accept_limit.is_some_and(|limit| events.len() >= limit) {
            return Err(Error::Sink("sink closed".into()));
        }
        events.push(event);
        if self.acknowledge {
            self.counter.complete(1);
        }
        Ok(())
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub(crate) struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub(crate) fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}
