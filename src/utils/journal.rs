use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const MAX_LOGGED_FIELD_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub event: String,
    pub payload: Value,
}

/// Cheap, cloneable producer side of the journal.
#[derive(Debug, Clone)]
pub struct JournalHandle {
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl JournalHandle {
    pub fn record(&self, direction: Direction, event: &str, payload: &Value) {
        let entry = JournalEntry {
            timestamp: Utc::now(),
            direction,
            event: event.to_string(),
            payload: payload.clone(),
        };
        if self.tx.send(entry).is_err() {
            debug!(event = %event, "Sync journal writer has stopped; entry dropped");
        }
    }
}

/// Append-only record of every frame sent or received, rotated by size.
///
/// The file stays open between entries and every line is flushed before the
/// next one is taken, so lines land in the order they were recorded.
#[derive(Debug)]
pub struct SyncJournal {
    log_file_path: PathBuf,
    max_size_bytes: u64,
    file: Option<File>,
    written: u64,
}

impl SyncJournal {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create sync journal directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
            file: None,
            written: 0,
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .journal_file
            .as_ref()
            .map(|path| Self::new(path.clone(), config.journal_max_size_bytes))
    }

    /// Moves the journal onto a background writer task.
    pub fn spawn(mut self) -> (JournalHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();
        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                self.write(&entry).await;
            }
            debug!(path = %self.log_file_path.display(), "Sync journal writer stopped");
        });
        (JournalHandle { tx }, task)
    }

    pub async fn write(&mut self, entry: &JournalEntry) {
        if let Err(e) = self.try_write(entry).await {
            error!(event = %entry.event, error = %e, "Failed to write sync journal");
            // Reopened on the next entry.
            self.file = None;
        }
    }

    async fn try_write(&mut self, entry: &JournalEntry) -> Result<()> {
        let payload = serde_json::to_string(&sanitize(&entry.payload))?;
        let line = format!(
            "{} | {:<3} | {:<24} | {}\n",
            entry.timestamp.to_rfc3339(),
            entry.direction.as_str(),
            entry.event,
            payload
        );

        if self.file.is_none() {
            self.open().await?;
        }
        if self.written >= self.max_size_bytes {
            self.rotate().await?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("sync journal is not open"))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        self.written += line.len() as u64;
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await
            .with_context(|| format!("opening {}", self.log_file_path.display()))?;
        self.written = file.metadata().await?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Moves the full journal aside as `<stem>.<timestamp>.<ext>` and starts
    /// a fresh file.
    async fn rotate(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        let stem = self
            .log_file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sync".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let archived = match self.log_file_path.extension() {
            Some(ext) => format!("{}.{}.{}", stem, stamp, ext.to_string_lossy()),
            None => format!("{}.{}", stem, stamp),
        };
        let archived = self.log_file_path.with_file_name(archived);
        fs::rename(&self.log_file_path, &archived).await?;
        debug!(archived = %archived.display(), bytes = self.written, "Rotated sync journal");
        self.open().await
    }
}

// Notes bodies and variable values can be large; keep the journal readable.
fn sanitize(payload: &Value) -> Value {
    let mut sanitized = payload.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for field in ["content", "value"] {
            if let Some(val) = obj.get_mut(field) {
                if val.as_str().is_some_and(|s| s.len() > MAX_LOGGED_FIELD_LEN) {
                    *val = Value::String(format!("<{} truncated for log>", field));
                }
            }
        }
    }
    sanitized
}
