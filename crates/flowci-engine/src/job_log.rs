use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowci_core::event::EventBus;
use flowci_core::types::JobEvent;

/// JSONL job event logger.
///
/// Writes every [`JobEvent`] as one JSON object per line to
/// `{log_dir}/{timestamp}.jsonl`. Lines already written survive a crash.
pub struct JobEventLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a JobEvent,
}

impl JobEventLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Subscribe now and write in the background until cancelled.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<JobEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "Job event log started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Job event log cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        let Some(line) = format_entry(&event) else { continue };
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Job event log lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }

        writer.flush().await.ok();
    }
}

fn format_entry(event: &JobEvent) -> Option<String> {
    let entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        event,
    };
    serde_json::to_string(&entry).ok().map(|json| json + "\n")
}
