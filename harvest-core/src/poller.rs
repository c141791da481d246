//! [PollCycle] performs one harvest of the window `[cursor, now)`.
//!
//! ```text
//!   window_end = now()
//!   loop:
//!     stop requested?        -> Interrupted, cursor untouched
//!     max_pages reached?     -> PaginationLimitExceeded, cursor untouched
//!     fetch page (retry)     -> error: window abandoned, cursor untouched
//!     for event in page:
//!       translate            -> failure: drop and log, keep walking
//!       ts >= window_end     -> deferred to the next window
//!       counter.add(); sink.submit(event)
//!     no continuation        -> break
//!   cursor.advance_to(window_end), record window for the checkpoint
//! ```
//!
//! The cursor only moves after the whole window was walked, so any failure leads to the same
//! window being fetched again. Events submitted before the failure are submitted again, delivery
//! is at-least-once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointCommitter;
use crate::config::PollConfig;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::fetcher::{FetchError, FetchRequest, PageFetcher};
use crate::message::{Page, RawEvent};
use crate::metrics::harvest_metrics;
use crate::sink::Sink;
use crate::tracker::InFlightCounter;
use crate::translator::EventTranslator;

const MAX_FETCH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Source of the window end. Tests drive it by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every page was walked and the cursor moved to the window end.
    Completed,
    /// Stop was requested between pages; the cursor did not move.
    Interrupted,
    /// The clock has not moved past the cursor, nothing to fetch.
    EmptyWindow,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::Interrupted => "interrupted",
            CycleOutcome::EmptyWindow => "empty",
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub pages: usize,
    pub submitted: u64,
    pub dropped: u64,
    pub deferred: u64,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            window_start,
            window_end,
            pages: 0,
            submitted: 0,
            dropped: 0,
            deferred: 0,
            outcome: CycleOutcome::Completed,
        }
    }
}

pub struct PollCycle<F, S> {
    fetcher: F,
    sink: S,
    translator: EventTranslator,
    cursor: Cursor,
    counter: InFlightCounter,
    config: PollConfig,
    clock: Arc<dyn Clock>,
    checkpoint: Option<CheckpointCommitter>,
    cln_token: CancellationToken,
}

/// PollCycleBuilder is used to build a [PollCycle] with optional parts.
pub struct PollCycleBuilder<F, S> {
    fetcher: F,
    sink: S,
    cursor: Cursor,
    counter: InFlightCounter,
    cln_token: CancellationToken,
    translator: Option<EventTranslator>,
    config: Option<PollConfig>,
    clock: Option<Arc<dyn Clock>>,
    checkpoint: Option<CheckpointCommitter>,
}

impl<F, S> PollCycleBuilder<F, S>
where
    F: PageFetcher,
    S: Sink,
{
    /// Create a new builder with mandatory fields
    pub fn new(
        fetcher: F,
        sink: S,
        cursor: Cursor,
        counter: InFlightCounter,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            sink,
            cursor,
            counter,
            cln_token,
            translator: None,
            config: None,
            clock: None,
            checkpoint: None,
        }
    }

    pub fn translator(mut self, translator: EventTranslator) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn config(mut self, config: PollConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Receives every completed window. It is saved once the sink acknowledged its events.
    pub fn checkpoint(mut self, checkpoint: CheckpointCommitter) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    #[must_use]
    pub fn build(self) -> PollCycle<F, S> {
        PollCycle {
            fetcher: self.fetcher,
            sink: self.sink,
            translator: self.translator.unwrap_or_default(),
            cursor: self.cursor,
            counter: self.counter,
            config: self.config.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            checkpoint: self.checkpoint,
            cln_token: self.cln_token,
        }
    }
}

impl<F, S> PollCycle<F, S>
where
    F: PageFetcher,
    S: Sink,
{
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Runs one harvest. On `Err` the cursor is exactly where it was before the call.
    pub async fn run(&mut self) -> Result<CycleReport> {
        let window_start = self.cursor.value();
        let window_end = self.clock.now();
        let mut report = CycleReport::new(window_start, window_end);

        if window_end <= window_start {
            debug!(
                %window_start,
                %window_end,
                "Clock has not moved past the cursor, skipping cycle"
            );
            report.outcome = CycleOutcome::EmptyWindow;
            return Ok(report);
        }

        if let Err(e) = self.walk(&mut report).await {
            warn!(
                %window_start,
                %window_end,
                pages = report.pages,
                submitted = report.submitted,
                error = %e,
                "Abandoning window, it will be fetched again next cycle"
            );
            return Err(e);
        }
        if report.outcome == CycleOutcome::Interrupted {
            info!(
                %window_start,
                %window_end,
                pages = report.pages,
                submitted = report.submitted,
                "Stop requested, leaving the rest of the window for the next run"
            );
            return Ok(report);
        }

        self.cursor.advance_to(window_end)?;
        harvest_metrics().watermark.set(window_end.timestamp());
        if let Some(committer) = &self.checkpoint {
            committer.record(window_end);
        }
        Ok(report)
    }

    async fn walk(&mut self, report: &mut CycleReport) -> Result<()> {
        let mut continuation: Option<String> = None;
        loop {
            // the stop signal is only honored between pages
            if self.cln_token.is_cancelled() {
                report.outcome = CycleOutcome::Interrupted;
                return Ok(());
            }
            if report.pages >= self.config.max_pages {
                return Err(Error::PaginationLimitExceeded {
                    max_pages: self.config.max_pages,
                    window_start: report.window_start,
                    window_end: report.window_end,
                });
            }

            let page = self
                .fetch(FetchRequest {
                    since: report.window_start,
                    until: report.window_end,
                    continuation: continuation.take(),
                    limit: self.config.page_limit,
                })
                .await?;
            report.pages += 1;
            harvest_metrics().pages.inc();
            debug!(
                page = report.pages,
                events = page.events.len(),
                more = page.continuation.is_some(),
                "Fetched page"
            );

            for raw in page.events {
                self.forward(raw, report).await?;
            }

            match page.continuation {
                Some(token) => continuation = Some(token),
                None => return Ok(()),
            }
        }
    }

    /// Fetches a page, retrying transient failures as configured.
    async fn fetch(&self, request: FetchRequest) -> Result<Page> {
        let fetcher = &self.fetcher;
        let backoff = Exponential::new(
            self.config.retry_interval,
            MAX_FETCH_RETRY_DELAY.max(self.config.retry_interval),
            2.0,
        )
        .with_jitter(0.1)
        .with_max_attempts(self.config.retry_attempts);

        Retry::new(
            backoff,
            move || fetcher.fetch(request.clone()),
            |e: &FetchError| e.is_retryable(),
        )
        .notify(|e: &FetchError, delay: Duration| {
            warn!(error = %e, ?delay, "Fetching page failed, retrying");
        })
        .await
        .map_err(Error::Fetch)
    }

    async fn forward(&mut self, raw: RawEvent, report: &mut CycleReport) -> Result<()> {
        let record_id = raw.text_field(self.translator.id_field());
        let event = match self.translator.translate(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    record_id = record_id.as_deref(),
                    window_start = %report.window_start,
                    window_end = %report.window_end,
                    error = %e,
                    "Dropping record that could not be translated"
                );
                report.dropped += 1;
                harvest_metrics().dropped.inc();
                return Ok(());
            }
        };

        if event.timestamp >= report.window_end {
            debug!(
                record_id = record_id.as_deref(),
                timestamp = %event.timestamp,
                "Deferring event to the next window"
            );
            report.deferred += 1;
            harvest_metrics().deferred.inc();
            return Ok(());
        }

        self.counter.add();
        if let Err(e) = self.sink.submit(event).await {
            // never reached the sink, nobody else will acknowledge it
            self.counter.complete(1);
            return Err(e);
        }
        report.submitted += 1;
        harvest_metrics().submitted.inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::test_utils::{ManualClock, RecordingSink, ScriptedFetcher, page, raw, ts};

    struct Harness {
        fetcher: ScriptedFetcher,
        sink: RecordingSink,
        counter: InFlightCounter,
        clock: ManualClock,
        cln_token: CancellationToken,
    }

    impl Harness {
        fn new(fetcher: ScriptedFetcher) -> Self {
            let counter = InFlightCounter::new();
            Self {
                fetcher,
                sink: RecordingSink::new(counter.clone()),
                counter,
                clock: ManualClock::new(ts(10, 0)),
                cln_token: CancellationToken::new(),
            }
        }

        fn builder(&self) -> PollCycleBuilder<ScriptedFetcher, RecordingSink> {
            PollCycleBuilder::new(
                self.fetcher.clone(),
                self.sink.clone(),
                Cursor::new(ts(9, 0)),
                self.counter.clone(),
                self.cln_token.clone(),
            )
            .clock(Arc::new(self.clock.clone()))
        }

        fn cycle(&self) -> PollCycle<ScriptedFetcher, RecordingSink> {
            self.builder().build()
        }
    }

    fn three_pages() -> Vec<std::result::Result<Page, FetchError>> {
        vec![
            Ok(page(vec![raw("a", ts(9, 1)), raw("b", ts(9, 2))], Some("p2"))),
            Ok(page(vec![raw("c", ts(9, 3)), raw("d", ts(9, 4))], Some("p3"))),
            Ok(page(vec![raw("e", ts(9, 5))], None)),
        ]
    }

    #[tokio::test]
    async fn walks_every_page_and_advances() {
        let harness = Harness::new(ScriptedFetcher::new(three_pages()));
        let mut cycle = harness.cycle();

        let report = cycle.run().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.pages, 3);
        assert_eq!(report.submitted, 5);
        assert_eq!(harness.sink.ids(), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(cycle.cursor().value(), ts(10, 0));
        assert_eq!(harness.counter.added(), 5);

        let requests = harness.fetcher.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].since, ts(9, 0));
        assert_eq!(requests[0].until, ts(10, 0));
        assert_eq!(requests[0].continuation, None);
        assert_eq!(requests[0].limit, 1000);
        assert_eq!(requests[1].continuation.as_deref(), Some("p2"));
        assert_eq!(requests[2].continuation.as_deref(), Some("p3"));
    }

    #[tokio::test]
    async fn failure_mid_window_keeps_cursor_and_refetches() {
        let fetcher = ScriptedFetcher::new([
            Ok(page(vec![raw("a", ts(9, 1)), raw("b", ts(9, 2))], Some("p2"))),
            Err(FetchError::Transient("503".into())),
        ]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness.cycle();

        let err = cycle.run().await.unwrap_err();
        assert!(matches!(err, Error::Fetch(FetchError::Transient(_))));
        assert_eq!(cycle.cursor().value(), ts(9, 0));
        assert_eq!(harness.sink.ids(), vec!["a", "b"]);

        for response in three_pages() {
            harness.fetcher.push(response);
        }
        harness.clock.set(ts(10, 1));
        let report = cycle.run().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Completed);
        // the second cycle starts from the same since and re-submits what it already sent
        let requests = harness.fetcher.requests();
        assert_eq!(requests[2].since, ts(9, 0));
        assert_eq!(requests[2].continuation, None);
        assert_eq!(
            harness.sink.ids(),
            vec!["a", "b", "a", "b", "c", "d", "e"]
        );
        assert_eq!(cycle.cursor().value(), ts(10, 1));
    }

    #[tokio::test]
    async fn malformed_record_is_dropped() {
        let fetcher = ScriptedFetcher::new([Ok(page(
            vec![
                raw("a", ts(9, 1)),
                RawEvent::from(serde_json::json!({"uuid": "broken", "published": 12})),
                raw("c", ts(9, 3)),
            ],
            None,
        ))]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness.cycle();

        let report = cycle.run().await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(harness.sink.ids(), vec!["a", "c"]);
        assert_eq!(cycle.cursor().value(), ts(10, 0));
    }

    #[tokio::test]
    async fn stop_between_pages_leaves_cursor() {
        let cln_token = CancellationToken::new();
        let fetcher = ScriptedFetcher::new(three_pages()).cancel_on(1, cln_token.clone());
        let mut harness = Harness::new(fetcher);
        harness.cln_token = cln_token;
        let mut cycle = harness.cycle();

        let report = cycle.run().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Interrupted);
        assert_eq!(report.pages, 1);
        // page 1 is finished, page 2 is never requested
        assert_eq!(harness.sink.ids(), vec!["a", "b"]);
        assert_eq!(harness.fetcher.requests().len(), 1);
        assert_eq!(cycle.cursor().value(), ts(9, 0));
    }

    #[tokio::test]
    async fn events_at_or_after_window_end_are_deferred() {
        let fetcher = ScriptedFetcher::new([Ok(page(
            vec![
                raw("a", ts(9, 59)),
                raw("b", ts(10, 0)),
                raw("c", ts(10, 1)),
            ],
            None,
        ))]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness.cycle();

        let report = cycle.run().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(harness.sink.ids(), vec!["a"]);
        assert_eq!(cycle.cursor().value(), ts(10, 0));
    }

    #[tokio::test]
    async fn pagination_guard_abandons_window() {
        let fetcher = ScriptedFetcher::new([
            Ok(page(vec![raw("a", ts(9, 1))], Some("p2"))),
            Ok(page(vec![raw("b", ts(9, 2))], Some("p3"))),
            Ok(page(vec![raw("c", ts(9, 3))], Some("p4"))),
        ]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness
            .builder()
            .config(PollConfig {
                max_pages: 2,
                ..Default::default()
            })
            .build();

        let err = cycle.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::PaginationLimitExceeded { max_pages: 2, .. }
        ));
        assert_eq!(harness.fetcher.requests().len(), 2);
        assert_eq!(cycle.cursor().value(), ts(9, 0));
    }

    #[tokio::test]
    async fn exactly_max_pages_completes() {
        let fetcher = ScriptedFetcher::new([
            Ok(page(vec![raw("a", ts(9, 1))], Some("p2"))),
            Ok(page(vec![raw("b", ts(9, 2))], None)),
        ]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness
            .builder()
            .config(PollConfig {
                max_pages: 2,
                ..Default::default()
            })
            .build();

        let report = cycle.run().await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.pages, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_fetch_failures() {
        let fetcher = ScriptedFetcher::new([
            Err(FetchError::Transient("429".into())),
            Err(FetchError::Transient("503".into())),
            Ok(page(vec![raw("a", ts(9, 1))], None)),
        ]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness
            .builder()
            .config(PollConfig {
                retry_attempts: 2,
                retry_interval: Duration::from_millis(100),
                ..Default::default()
            })
            .build();

        let report = cycle.run().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(harness.fetcher.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_not_retried() {
        let fetcher = ScriptedFetcher::new([Err(FetchError::Auth("401".into()))]);
        let harness = Harness::new(fetcher);
        let mut cycle = harness
            .builder()
            .config(PollConfig {
                retry_attempts: 5,
                ..Default::default()
            })
            .build();

        let err = cycle.run().await.unwrap_err();
        assert!(matches!(err, Error::Fetch(FetchError::Auth(_))));
        assert_eq!(harness.fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn clock_behind_cursor_is_an_empty_window() {
        let harness = Harness::new(ScriptedFetcher::default());
        harness.clock.set(ts(8, 0));
        let mut cycle = harness.cycle();

        let report = cycle.run().await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::EmptyWindow);
        assert!(harness.fetcher.requests().is_empty());
        assert_eq!(cycle.cursor().value(), ts(9, 0));
    }

    #[tokio::test]
    async fn sink_refusal_aborts_and_balances_counter() {
        let harness = Harness::new(ScriptedFetcher::new(three_pages()));
        let sink = harness.sink.clone().accept_limit(3);
        let mut cycle = PollCycleBuilder::new(
            harness.fetcher.clone(),
            sink,
            Cursor::new(ts(9, 0)),
            harness.counter.clone(),
            harness.cln_token.clone(),
        )
        .clock(Arc::new(harness.clock.clone()))
        .build();

        let err = cycle.run().await.unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(cycle.cursor().value(), ts(9, 0));
        assert_eq!(harness.counter.added(), 4);
        assert_eq!(harness.counter.pending(), 0);
    }

    #[tokio::test]
    async fn saves_checkpoint_after_completed_window() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let harness = Harness::new(ScriptedFetcher::new(three_pages()));
        let committer = CheckpointCommitter::new(
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            harness.counter.clone(),
        );
        let mut cycle = harness.builder().checkpoint(committer.clone()).build();

        cycle.run().await.unwrap();
        assert_eq!(committer.commit().await, Some(ts(10, 0)));
        assert_eq!(store.load().unwrap(), Some(ts(10, 0)));
    }

    #[tokio::test]
    async fn checkpoint_waits_for_acknowledgements() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let harness = Harness::new(ScriptedFetcher::new([Ok(page(
            vec![raw("a", ts(9, 1)), raw("b", ts(9, 2))],
            None,
        ))]));
        let committer = CheckpointCommitter::new(
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            harness.counter.clone(),
        );
        let mut cycle = PollCycleBuilder::new(
            harness.fetcher.clone(),
            harness.sink.clone().without_acks(),
            Cursor::new(ts(9, 0)),
            harness.counter.clone(),
            harness.cln_token.clone(),
        )
        .clock(Arc::new(harness.clock.clone()))
        .checkpoint(committer.clone())
        .build();

        let report = cycle.run().await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(cycle.cursor().value(), ts(10, 0));

        // nothing acknowledged, a restart must fetch the window again
        assert_eq!(committer.commit().await, None);
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(harness.counter.pending(), 2);

        harness.counter.complete(1);
        assert_eq!(committer.commit().await, None);

        harness.counter.complete(1);
        assert_eq!(committer.commit().await, Some(ts(10, 0)));
        assert_eq!(store.load().unwrap(), Some(ts(10, 0)));
    }

    #[tokio::test]
    async fn unacknowledged_events_stay_pending() {
        let harness = Harness::new(ScriptedFetcher::new(three_pages()));
        let sink = harness.sink.clone().without_acks();
        let mut cycle = PollCycleBuilder::new(
            harness.fetcher.clone(),
            sink,
            Cursor::new(ts(9, 0)),
            harness.counter.clone(),
            harness.cln_token.clone(),
        )
        .clock(Arc::new(harness.clock.clone()))
        .build();

        cycle.run().await.unwrap();
        assert_eq!(harness.counter.pending(), 5);
    }
}
