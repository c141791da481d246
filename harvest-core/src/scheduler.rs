use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::fetcher::PageFetcher;
use crate::metrics::{cycle_labels, harvest_metrics};
use crate::poller::{CycleOutcome, PollCycle};
use crate::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// A poll cycle is in progress.
    Running,
    Stopped,
}

/// Scheduler runs one [PollCycle] per `period`. The next tick is only awaited after the cycle
/// returned, so cycles never overlap; a cycle slower than the period delays the following tick
/// instead of queueing up missed ones.
pub struct Scheduler<F, S> {
    cycle: PollCycle<F, S>,
    period: Duration,
    cln_token: CancellationToken,
    state: watch::Sender<SchedulerState>,
}

impl<F, S> Scheduler<F, S>
where
    F: PageFetcher,
    S: Sink,
{
    pub fn new(cycle: PollCycle<F, S>, period: Duration, cln_token: CancellationToken) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            cycle,
            period,
            cln_token,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Runs until the cancellation token is cancelled or a cycle fails fatally. Dropping the
    /// scheduler on return releases the sink handle, which lets the sink drain and exit.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.state.send_replace(SchedulerState::Running);
            let result = self.run_cycle().await;
            self.state.send_replace(SchedulerState::Idle);

            if let Err(e) = result {
                error!(error = %e, "Stopping scheduler on fatal error");
                self.state.send_replace(SchedulerState::Stopped);
                return Err(e);
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        info!(watermark = %self.cycle.cursor().value(), "Scheduler stopped");
        Ok(())
    }

    /// Runs one cycle. Only fatal errors are returned, everything else is logged.
    async fn run_cycle(&mut self) -> Result<()> {
        let start = Instant::now();
        let result = self.cycle.run().await;
        harvest_metrics()
            .cycle_duration
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                harvest_metrics()
                    .cycles
                    .get_or_create(&cycle_labels(report.outcome.as_str()))
                    .inc();
                if report.outcome == CycleOutcome::Completed {
                    info!(
                        window_start = %report.window_start,
                        window_end = %report.window_end,
                        pages = report.pages,
                        submitted = report.submitted,
                        dropped = report.dropped,
                        deferred = report.deferred,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Poll cycle completed"
                    );
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                harvest_metrics()
                    .cycles
                    .get_or_create(&cycle_labels("fatal"))
                    .inc();
                Err(e)
            }
            Err(e) => {
                // already logged with the window bounds by the cycle
                harvest_metrics()
                    .cycles
                    .get_or_create(&cycle_labels("failed"))
                    .inc();
                error!(error = %e, "Poll cycle failed");
                Ok(())
            }
        }
    }
}
