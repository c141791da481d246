use tracing::info;

use crate::error::{Error, Result};
use crate::message::NormalizedEvent;
use crate::sink::SinkWriter;

pub(crate) struct LogSink;

impl SinkWriter for LogSink {
    async fn write(&self, events: &[NormalizedEvent]) -> Result<()> {
        for event in events {
            let line = serde_json::to_string(&event.to_document())
                .map_err(|e| Error::Sink(format!("encoding event: {e}")))?;
            info!(record_id = event.id.as_deref(), "{}", line);
        }
        Ok(())
    }
}
