//! Delivery of normalized events.
//!
//! [SinkHandle] fronts a delivery task (actor) through a bounded channel, so a slow destination
//! pushes back on the poll cycle instead of buffering without limit. The task drains the channel
//! in batches, writes each batch through a [SinkWriter] with a fixed-interval retry, and then
//! reports every event of the batch to the [InFlightCounter] exactly once, whether it was
//! delivered or abandoned.

use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::fixed;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::{SinkConfig, SinkType};
use crate::error::{Error, Result};
use crate::message::NormalizedEvent;
use crate::metrics::harvest_metrics;
use crate::tracker::InFlightCounter;

/// Discards everything, for dry runs and load tests.
mod blackhole;
/// POSTs batches as newline-delimited JSON.
mod http;
/// Writes every event to the application log.
mod log;

/// Accepts events for asynchronous delivery. Acknowledgment is reported to the
/// [InFlightCounter] the sink was built with, not to the caller.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub trait LocalSink {
    /// Hands the event over. Waits while the sink applies backpressure and fails only when the
    /// sink can no longer accept events.
    async fn submit(&mut self, event: NormalizedEvent) -> Result<()>;
}

/// A destination the delivery task writes batches to.
#[trait_variant::make(SinkWriter: Send)]
#[allow(dead_code)]
pub trait LocalSinkWriter {
    async fn write(&self, events: &[NormalizedEvent]) -> Result<()>;
}

struct SinkActor<W> {
    receiver: mpsc::Receiver<NormalizedEvent>,
    writer: W,
    batch_size: usize,
    retry_attempts: u16,
    retry_interval: Duration,
    counter: InFlightCounter,
}

impl<W> SinkActor<W>
where
    W: SinkWriter + Sync,
{
    async fn run(mut self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        while self.receiver.recv_many(&mut batch, self.batch_size).await > 0 {
            self.deliver(&batch).await;
            batch.clear();
        }
        debug!("All sink handles dropped, delivery task exiting");
    }

    async fn deliver(&self, batch: &[NormalizedEvent]) {
        let writer = &self.writer;
        let interval =
            fixed::Interval::new(self.retry_interval).take(usize::from(self.retry_attempts));
        let result = Retry::new(interval, move || writer.write(batch), |_: &Error| true)
            .notify(|err: &Error, delay: Duration| {
                warn!(%err, ?delay, "Sink write failed, retrying");
            })
            .await;

        let count = batch.len() as u64;
        match result {
            Ok(()) => {
                harvest_metrics().acked.inc_by(count);
            }
            Err(e) => {
                error!(
                    error = %e,
                    count,
                    first_record_id = batch.first().and_then(|ev| ev.id.as_deref()),
                    last_record_id = batch.last().and_then(|ev| ev.id.as_deref()),
                    "Abandoning events, sink retries exhausted"
                );
                harvest_metrics().abandoned.inc_by(count);
            }
        }
        self.counter.complete(count);
    }
}

/// The actor task exits once every clone of the handle is dropped and the channel buffer is
/// drained.
#[derive(Clone)]
pub struct SinkHandle {
    sender: mpsc::Sender<NormalizedEvent>,
}

impl SinkHandle {
    pub fn new(config: &SinkConfig, counter: InFlightCounter) -> Result<(Self, JoinHandle<()>)> {
        match &config.sink_type {
            SinkType::Log => Ok(Self::with_writer(log::LogSink, config, counter)),
            SinkType::Blackhole => Ok(Self::with_writer(blackhole::BlackholeSink, config, counter)),
            SinkType::Http { url } => {
                let writer = http::HttpSink::new(url, config.request_timeout)?;
                Ok(Self::with_writer(writer, config, counter))
            }
        }
    }

    pub fn with_writer<W>(
        writer: W,
        config: &SinkConfig,
        counter: InFlightCounter,
    ) -> (Self, JoinHandle<()>)
    where
        W: SinkWriter + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let actor = SinkActor {
            receiver,
            writer,
            batch_size: config.batch_size.max(1),
            retry_attempts: config.retry_attempts,
            retry_interval: config.retry_interval,
            counter,
        };
        let handle = tokio::spawn(actor.run());
        (Self { sender }, handle)
    }
}

/// Checks that a sink can be built from `config` without starting it.
pub(crate) fn check_config(config: &SinkConfig) -> Result<()> {
    if let SinkType::Http { url } = &config.sink_type {
        http::HttpSink::new(url, config.request_timeout)?;
    }
    Ok(())
}

impl Sink for SinkHandle {
    async fn submit(&mut self, event: NormalizedEvent) -> Result<()> {
        self.sender.send(event).await.map_err(|mpsc::error::SendError(event)| {
            Error::Sink(format!(
                "delivery task is gone, cannot accept record {:?}",
                event.id
            ))
        })
    }
}
