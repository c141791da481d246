//! Incremental harvesting of audit-log events.
//!
//! A [Scheduler](scheduler::Scheduler) runs one [PollCycle](poller::PollCycle) per poll period.
//! Each cycle walks every page of the window `[cursor, now)`, translates the records and submits
//! them to a [Sink](sink::Sink). The cursor only moves once the whole window was walked, and a
//! window is only checkpointed once the sink acknowledged its events. On shutdown the
//! [ShutdownCoordinator](tracker::ShutdownCoordinator) waits for the sink to acknowledge
//! everything that was submitted.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use crate::error::{Error, Result};

pub mod checkpoint;
pub mod config;
pub mod cursor;
mod error;
pub mod fetcher;
pub mod message;
mod metrics;
pub mod poller;
pub mod scheduler;
pub mod sink;
pub mod tracker;
pub mod translator;

#[cfg(test)]
mod test_utils;

use crate::checkpoint::{CheckpointCommitter, CheckpointStore, FileCheckpointStore};
use crate::config::Settings;
use crate::cursor::Cursor;
use crate::metrics::{MetricsState, start_metrics_https_server};
use crate::poller::PollCycleBuilder;
use crate::scheduler::Scheduler;
use crate::sink::SinkHandle;
use crate::tracker::{DrainOutcome, InFlightCounter, ShutdownCoordinator};

/// Runs the harvester until SIGINT or SIGTERM.
pub async fn harvest(settings: Settings) -> Result<()> {
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = run(settings, cln_token).await;

    // abort the signal handler task since we are shutting down anyway
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    let outcome = result.inspect_err(|e| error!("Application error: {:?}", e))?;
    info!(?outcome, "Gracefully Exiting...");
    Ok(())
}

/// Checks that the harvester could start with `settings`, without contacting anything.
pub fn check(settings: &Settings) -> Result<()> {
    settings.validate()?;
    fetcher::okta::new_okta_fetcher(settings)?;
    sink::check_config(&settings.sink)?;
    if let Some(path) = &settings.checkpoint_path {
        FileCheckpointStore::new(path).load()?;
    }
    Ok(())
}

/// Harvests until `cln_token` is cancelled, then waits for the sink to drain.
pub async fn run(settings: Settings, cln_token: CancellationToken) -> Result<DrainOutcome> {
    settings.validate()?;
    let counter = InFlightCounter::new();

    let checkpoint = settings
        .checkpoint_path
        .as_ref()
        .map(|path| Arc::new(FileCheckpointStore::new(path)) as Arc<dyn CheckpointStore>);
    let saved = match &checkpoint {
        Some(store) => {
            let store = Arc::clone(store);
            tokio::task::spawn_blocking(move || store.load())
                .await
                .map_err(|e| Error::Checkpoint(format!("checkpoint task failed: {e}")))??
        }
        None => None,
    };
    let cursor = Cursor::resolve(
        saved,
        settings.start_time,
        Utc::now(),
        settings.initial_lookback,
    );
    info!(
        watermark = %cursor.value(),
        from_checkpoint = saved.is_some(),
        poll_period = ?settings.poll_period,
        "Starting harvest"
    );

    let fetcher = fetcher::okta::new_okta_fetcher(&settings)?;
    let (sink, sink_task) = SinkHandle::new(&settings.sink, counter.clone())?;

    let committer = checkpoint.map(|store| CheckpointCommitter::new(store, counter.clone()));
    let commit_cln_token = CancellationToken::new();
    let commit_handle = committer
        .clone()
        .map(|committer| tokio::spawn(committer.run(commit_cln_token.clone())));

    let mut builder =
        PollCycleBuilder::new(fetcher, sink, cursor, counter.clone(), cln_token.clone())
            .config(settings.poll.clone());
    if let Some(committer) = &committer {
        builder = builder.checkpoint(committer.clone());
    }
    let scheduler = Scheduler::new(builder.build(), settings.poll_period, cln_token);

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_state = MetricsState {
        scheduler: scheduler.subscribe(),
        in_flight: counter.clone(),
    };
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = start_metrics_https_server(metrics_addr, metrics_state).await {
            error!("Metrics server error: {:?}", e);
        }
    });

    // the scheduler owns the only sink handle, once it returns the sink drains and exits
    let result = scheduler.run().await;

    let outcome = ShutdownCoordinator::new(counter)
        .wait(settings.shutdown_timeout)
        .await;
    match outcome {
        DrainOutcome::Drained => {
            info!("All submitted events were acknowledged");
            if let Err(e) = sink_task.await {
                warn!(?e, "Sink task did not finish cleanly");
            }
        }
        DrainOutcome::TimedOut { pending } => {
            warn!(
                pending,
                timeout = ?settings.shutdown_timeout,
                "Shutdown timeout elapsed before the sink drained"
            );
            sink_task.abort();
        }
    }

    // persist the newest window whose events were all acknowledged
    commit_cln_token.cancel();
    if let Some(handle) = commit_handle {
        if let Err(e) = handle.await {
            warn!(?e, "Checkpoint task did not finish cleanly");
        }
    }
    if let Some(committer) = &committer {
        if let Some(watermark) = committer.commit().await {
            info!(%watermark, "Saved final checkpoint");
        }
    }
    metrics_handle.abort();

    result.map(|()| outcome)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
