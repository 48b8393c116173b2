use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

pub const USAGE_LOG_FILE: &str = "usage.jsonl";

/// One line of the usage log. Token counts stay null when upstream never reported them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLogEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub model: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("usage log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("usage log encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("usage log writer stopped")]
    Closed,
}

struct AppendCommand {
    line: String,
    ack: oneshot::Sender<Result<(), LogError>>,
}

/// Append-only JSON-lines log. A single writer task owns the file, so
/// concurrent appends land as whole lines in arrival order.
#[derive(Clone)]
pub struct UsageLogger {
    tx: mpsc::Sender<AppendCommand>,
    path: Arc<PathBuf>,
}

impl UsageLogger {
    /// Starts the writer task. Must be called inside a tokio runtime.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let path = Arc::new(log_dir.into().join(USAGE_LOG_FILE));
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_writer(path.clone(), rx));
        Self { tx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an entry; failures are logged and never returned.
    pub async fn append(&self, entry: &UsageLogEntry) {
        if let Err(err) = self.try_append(entry).await {
            metrics::counter!("askrelay_usage_log_failures_total").increment(1);
            tracing::warn!(
                error = %err,
                user_id = %entry.user_id,
                model = %entry.model,
                "failed to append usage log entry"
            );
        }
    }

    pub async fn try_append(&self, entry: &UsageLogEntry) -> Result<(), LogError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let (ack, done) = oneshot::channel();
        self.tx
            .send(AppendCommand { line, ack })
            .await
            .map_err(|_| LogError::Closed)?;
        done.await.map_err(|_| LogError::Closed)?
    }
}

async fn run_writer(path: Arc<PathBuf>, mut rx: mpsc::Receiver<AppendCommand>) {
    let mut file: Option<File> = None;
    while let Some(cmd) = rx.recv().await {
        // A failed write drops the handle so the next append reopens the file.
        let result = write_line(&path, &mut file, &cmd.line).await;
        let _ = cmd.ack.send(result);
    }
}

async fn write_line(path: &Path, file: &mut Option<File>, line: &str) -> Result<(), LogError> {
    let mut handle = match file.take() {
        Some(handle) => handle,
        None => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?
        }
    };
    handle.write_all(line.as_bytes()).await?;
    handle.flush().await?;
    *file = Some(handle);
    Ok(())
}
