//! Persists the cursor watermark so a restart resumes where the last acknowledged window ended
//! instead of falling back to the configured lookback.
//!
//! The sink delivers in the background, so a completed window is not yet a delivered window.
//! [CheckpointCommitter] holds each completed window back until the sink acknowledged every event
//! submitted up to its end, and only then saves it.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;
use crate::Result;
use crate::metrics::harvest_metrics;
use crate::tracker::InFlightCounter;

const COMMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Storage backend for the watermark. Calls may block, [CheckpointCommitter] runs saves on the
/// blocking pool.
pub trait CheckpointStore: Send + Sync {
    /// Returns the saved watermark, `None` on a first run.
    fn load(&self) -> Result<Option<DateTime<Utc>>>;

    fn save(&self, watermark: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    watermark: DateTime<Utc>,
    saved_at: DateTime<Utc>,
}

/// JSON file store. Writes go to a sibling temp file that is renamed over the target, so a crash
/// leaves either the old or the new checkpoint behind.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<DateTime<Utc>>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Checkpoint(format!(
                    "reading {}: {e}",
                    self.path.display()
                )));
            }
        };
        let file: CheckpointFile = serde_json::from_slice(&contents).map_err(|e| {
            Error::Checkpoint(format!("parsing {}: {e}", self.path.display()))
        })?;
        Ok(Some(file.watermark))
    }

    fn save(&self, watermark: DateTime<Utc>) -> Result<()> {
        let write_err =
            |e: std::io::Error| Error::Checkpoint(format!("writing {}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let body = serde_json::to_vec_pretty(&CheckpointFile {
            watermark,
            saved_at: Utc::now(),
        })
        .map_err(|e| Error::Checkpoint(format!("encoding checkpoint: {e}")))?;

        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).map_err(write_err)?;
        file.write_all(&body).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        fs::rename(&temp, &self.path).map_err(write_err)?;
        Ok(())
    }
}

/// Keeps the watermark in memory. Later saves never move it backwards.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    watermark: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watermark(watermark: DateTime<Utc>) -> Self {
        Self {
            watermark: RwLock::new(Some(watermark)),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.watermark.read())
    }

    fn save(&self, watermark: DateTime<Utc>) -> Result<()> {
        let mut current = self.watermark.write();
        if current.is_none_or(|saved| watermark > saved) {
            *current = Some(watermark);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    watermark: DateTime<Utc>,
    /// Events submitted when the window completed.
    submitted: u64,
}

/// Saves completed windows once the sink caught up with them.
#[derive(Clone)]
pub struct CheckpointCommitter {
    store: Arc<dyn CheckpointStore>,
    counter: InFlightCounter,
    marks: Arc<Mutex<VecDeque<Mark>>>,
    recorded: Arc<Notify>,
}

impl CheckpointCommitter {
    pub fn new(store: Arc<dyn CheckpointStore>, counter: InFlightCounter) -> Self {
        Self {
            store,
            counter,
            marks: Arc::new(Mutex::new(VecDeque::new())),
            recorded: Arc::new(Notify::new()),
        }
    }

    /// Records a completed window. Must be called after its last event was submitted.
    pub fn record(&self, watermark: DateTime<Utc>) {
        self.marks.lock().push_back(Mark {
            watermark,
            submitted: self.counter.added(),
        });
        self.recorded.notify_one();
    }

    /// Saves the newest recorded watermark whose events are all acknowledged and returns it.
    /// `None` when nothing was acknowledged yet or the save failed.
    pub async fn commit(&self) -> Option<DateTime<Utc>> {
        let completed = self.counter.completed();
        let mark = {
            let mut marks = self.marks.lock();
            let mut latest = None;
            while let Some(mark) = marks.front().copied() {
                if mark.submitted > completed {
                    break;
                }
                marks.pop_front();
                latest = Some(mark);
            }
            latest
        }?;

        match self.persist(mark.watermark).await {
            Ok(()) => {
                debug!(watermark = %mark.watermark, "Saved checkpoint");
                Some(mark.watermark)
            }
            Err(e) => {
                // a stale checkpoint only means re-delivery after a restart
                warn!(error = %e, watermark = %mark.watermark, "Saving checkpoint failed");
                harvest_metrics().checkpoint_failures.inc();
                self.marks.lock().push_front(mark);
                None
            }
        }
    }

    /// Commits watermarks as the sink acknowledges events, until `cln_token` is cancelled.
    pub async fn run(self, cln_token: CancellationToken) {
        loop {
            let next = self.marks.lock().front().map(|mark| mark.submitted);
            match next {
                Some(submitted) => tokio::select! {
                    biased;
                    _ = cln_token.cancelled() => return,
                    _ = self.counter.completed_at_least(submitted) => {}
                },
                None => tokio::select! {
                    biased;
                    _ = cln_token.cancelled() => return,
                    _ = self.recorded.notified() => continue,
                },
            }

            if self.commit().await.is_none() {
                tokio::select! {
                    biased;
                    _ = cln_token.cancelled() => return,
                    _ = tokio::time::sleep(COMMIT_RETRY_DELAY) => {}
                }
            }
        }
    }

    async fn persist(&self, watermark: DateTime<Utc>) -> Result<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(watermark))
            .await
            .map_err(|e| Error::Checkpoint(format!("checkpoint task failed: {e}")))?
    }
}
