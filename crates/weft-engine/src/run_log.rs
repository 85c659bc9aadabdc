use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::error::Result;
use weft_core::event::EventBus;
use weft_core::types::{ExecutionEvent, RunEvent, RunId};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends every run event to
/// `{log_dir}/{run_id}.jsonl`, one serialized [`RunEvent`] per line. Each line
/// is flushed as it is written, so a log survives a crash up to its last
/// complete line.
pub struct RunLogger {
    log_dir: PathBuf,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Run the logger until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }

        info!(path = %self.log_dir.display(), "RunLogger started");

        let mut rx = event_bus.subscribe();
        let mut open: HashMap<RunId, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => self.write(&mut open, event).await,
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in open.drain() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn write(&self, open: &mut HashMap<RunId, BufWriter<File>>, event: RunEvent) {
        if matches!(event.event, ExecutionEvent::Keepalive) {
            return;
        }

        if !open.contains_key(&event.run_id) {
            let path = self.path_for(&event.run_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    open.insert(event.run_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open run log");
                    return;
                }
            }
        }

        let done = event.is_terminal();
        if let Some(writer) = open.get_mut(&event.run_id) {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, run_id = %event.run_id, "Failed to write log entry");
                    } else if let Err(e) = writer.flush().await {
                        error!(error = %e, run_id = %event.run_id, "Failed to flush log");
                    }
                }
                Err(e) => error!(error = %e, "Failed to serialize run event"),
            }
        }

        if done {
            open.remove(&event.run_id);
        }
    }

    /// Read a run log back. Blank and truncated trailing lines are skipped.
    pub async fn replay(path: &Path) -> Result<Vec<RunEvent>> {
        let file = File::open(path).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut events = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, path = %path.display(), "Skipping unreadable log line"),
            }
        }
        Ok(events)
    }
}
