//! Append-only JSON-lines log of submissions classified as spam.
//!
//! Records go to one partition file per UTC day, `spam-<YYYY-MM-DD>.jsonl`. A partition which
//! has reached the size cap is renamed to `spam-<YYYY-MM-DD>.jsonl.<unix-ts>` before the next
//! write, and any partition whose modification time is older than the retention window is
//! deleted after a successful append. All file access on one [`SpamLog`] goes through a single
//! lock.

use crate::settings::SpamLogSettings;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

const PARTITION_PREFIX: &str = "spam-";
const PARTITION_EXTENSION: &str = ".jsonl";

const MAX_EMAIL_LENGTH: usize = 100;
const MAX_SUBJECT_LENGTH: usize = 200;
const MAX_MESSAGE_LENGTH: usize = 500;
const MAX_REASON_LENGTH: usize = 100;
const MAX_CLIENT_IP_LENGTH: usize = 50;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SpamRecord {
    pub timestamp: DateTime<Utc>,
    pub sender_email: String,
    pub subject: String,
    pub message: String,
    pub reason: String,
    pub client_ip: String,
}

impl SpamRecord {
    /// Builds a record from untrusted input. Every field is HTML-escaped, stripped of control
    /// characters other than tab and newline, and cut to its maximum length.
    pub fn new(
        timestamp: DateTime<Utc>,
        sender_email: &str,
        subject: &str,
        message: &str,
        reason: &str,
        client_ip: &str,
    ) -> Self {
        Self {
            timestamp,
            sender_email: sanitize(sender_email, MAX_EMAIL_LENGTH),
            subject: sanitize(subject, MAX_SUBJECT_LENGTH),
            message: sanitize(message, MAX_MESSAGE_LENGTH),
            reason: sanitize(reason, MAX_REASON_LENGTH),
            client_ip: sanitize(client_ip, MAX_CLIENT_IP_LENGTH),
        }
    }
}

fn sanitize(input: &str, max_length: usize) -> String {
    let mut escaped = String::with_capacity(input.len());
    // The default formatter HTML-escapes strings and cannot fail on them.
    let _ = tinytemplate::format(&Value::String(input.into()), &mut escaped);
    let cleaned: String = escaped
        .chars()
        .filter(|c| !c.is_ascii_control() || *c == '\t' || *c == '\n')
        .take(max_length)
        .collect();
    cleaned.trim().into()
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create spam log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to rotate spam log {path}: {source}")]
    Rotate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write spam log {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read spam log directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode spam record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct SpamLog {
    inner: Arc<SpamLogInner>,
}

struct SpamLogInner {
    settings: SpamLogSettings,
    lock: Mutex<()>,
}

impl SpamLog {
    pub fn new(settings: SpamLogSettings) -> Self {
        Self {
            inner: Arc::new(SpamLogInner {
                settings,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.settings.dir
    }

    /// Appends the record to the partition for its day, rotating the partition first if it
    /// is full. Expired partitions are removed in the background afterwards.
    pub async fn append(&self, record: &SpamRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        {
            let _guard = self.inner.lock.lock().await;
            fs::create_dir_all(self.dir())
                .await
                .map_err(|source| StorageError::CreateDirectory {
                    path: self.dir().into(),
                    source,
                })?;
            let path = self.partition_path(record.timestamp.date_naive());
            self.rotate_if_full(&path).await?;
            Self::write_line(&path, &line)
                .await
                .map_err(|source| StorageError::Write { path, source })?;
        }

        let log = self.clone();
        tokio::spawn(async move {
            log.remove_expired().await;
        });
        Ok(())
    }

    /// All records newer than `since` ago, most recent first.
    pub async fn query(&self, since: Duration) -> Result<Vec<SpamRecord>, StorageError> {
        let since = chrono::Duration::from_std(since).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(since)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.records_after(cutoff).await
    }

    /// All records with a timestamp strictly after `cutoff`, most recent first. Unreadable
    /// partitions and malformed lines are skipped.
    pub async fn records_after(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SpamRecord>, StorageError> {
        let _guard = self.inner.lock.lock().await;
        let mut records = Vec::new();
        for path in self.partitions().await? {
            let content = match fs::read(&path).await {
                Ok(content) => content,
                Err(error) => {
                    warn!(path = %path.display(), %error, "Skipping unreadable spam log");
                    continue;
                }
            };
            for line in String::from_utf8_lossy(&content).lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SpamRecord>(line) {
                    Ok(record) if record.timestamp > cutoff => records.push(record),
                    Ok(_) => {}
                    Err(error) => {
                        debug!(path = %path.display(), %error, "Skipping malformed spam log line")
                    }
                }
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// Deletes partitions last modified before the retention window. Returns how many were
    /// deleted; failures are logged and otherwise ignored.
    pub async fn remove_expired(&self) -> usize {
        let _guard = self.inner.lock.lock().await;
        let Some(cutoff) = SystemTime::now().checked_sub(self.inner.settings.retention) else {
            return 0;
        };
        let partitions = match self.partitions().await {
            Ok(partitions) => partitions,
            Err(error) => {
                warn!(%error, "Could not list spam logs for cleanup");
                return 0;
            }
        };
        let mut removed = 0;
        for path in partitions {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "Removed expired spam log");
                    removed += 1;
                }
                Err(error) => warn!(path = %path.display(), %error, "Could not remove expired spam log"),
            }
        }
        removed
    }

    fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.dir().join(format!(
            "{PARTITION_PREFIX}{}{PARTITION_EXTENSION}",
            date.format("%Y-%m-%d")
        ))
    }

    async fn rotate_if_full(&self, path: &Path) -> Result<(), StorageError> {
        let size = match fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StorageError::Rotate {
                    path: path.into(),
                    source,
                })
            }
        };
        if size < self.inner.settings.max_file_size {
            return Ok(());
        }
        let rotated = Self::rotated_path(path)
            .await
            .map_err(|source| StorageError::Rotate {
                path: path.into(),
                source,
            })?;
        fs::rename(path, &rotated)
            .await
            .map_err(|source| StorageError::Rotate {
                path: path.into(),
                source,
            })?;
        info!(from = %path.display(), to = %rotated.display(), "Rotated spam log");
        Ok(())
    }

    async fn rotated_path(path: &Path) -> std::io::Result<PathBuf> {
        let timestamp = Utc::now().timestamp();
        let base = format!("{}.{timestamp}", path.display());
        let mut candidate = PathBuf::from(&base);
        let mut counter = 1;
        while fs::try_exists(&candidate).await? {
            candidate = PathBuf::from(format!("{base}-{counter}"));
            counter += 1;
        }
        Ok(candidate)
    }

    async fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Active and rotated partitions in the log directory. A missing directory has none.
    async fn partitions(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut entries = match fs::read_dir(self.dir()).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => {
                return Err(StorageError::ReadDirectory {
                    path: self.dir().into(),
                    source,
                })
            }
        };
        let mut partitions = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StorageError::ReadDirectory {
                        path: self.dir().into(),
                        source,
                    })
                }
            };
            let file_name = entry.file_name();
            if is_partition_name(&file_name.to_string_lossy()) {
                partitions.push(entry.path());
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

fn is_partition_name(name: &str) -> bool {
    name.starts_with(PARTITION_PREFIX)
        && (name.ends_with(PARTITION_EXTENSION)
            || name.contains(&format!("{PARTITION_EXTENSION}.")))
}
