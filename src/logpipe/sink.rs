//! Pluggable log sinks: a real file-backed implementation with rotation,
//! plus tracing-backed stand-ins for the external stores SPEC_FULL.md
//! scopes out of this build (SQL/MongoDB/Elasticsearch/ClickHouse).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::Result;

#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, records: &[serde_json::Value]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    Size,
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSinkConfig {
    pub directory: PathBuf,
    pub file_prefix: String,
    pub rotation: RotationPolicy,
    pub max_size_bytes: u64,
    pub retention_days: u32,
}

struct FileState {
    file: tokio::fs::File,
    path: PathBuf,
    bytes_written: u64,
    opened_at: chrono::DateTime<chrono::Utc>,
}

/// Appends newline-delimited JSON, rotating by size or calendar boundary
/// and pruning files older than `retention_days` on each rotation.
pub struct FileSink {
    cfg: FileSinkConfig,
    state: Mutex<Option<FileState>>,
}

impl FileSink {
    pub async fn new(cfg: FileSinkConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&cfg.directory).await.map_err(crate::Error::Io)?;
        Ok(FileSink { cfg, state: Mutex::new(None) })
    }

    fn current_file_name(&self, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
        let suffix = match self.cfg.rotation {
            RotationPolicy::Size => now.format("%Y%m%d%H%M%S").to_string(),
            RotationPolicy::Daily => now.format("%Y%m%d").to_string(),
            RotationPolicy::Hourly => now.format("%Y%m%d%H").to_string(),
        };
        self.cfg.directory.join(format!("{}-{suffix}.log", self.cfg.file_prefix))
    }

    fn needs_rotation(&self, state: &FileState, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.cfg.rotation {
            RotationPolicy::Size => state.bytes_written >= self.cfg.max_size_bytes,
            RotationPolicy::Daily => now.date_naive() != state.opened_at.date_naive(),
            RotationPolicy::Hourly => now.format("%Y%m%d%H").to_string() != state.opened_at.format("%Y%m%d%H").to_string(),
        }
    }

    async fn prune_old_files(&self) {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.cfg.retention_days as i64);
        let Ok(mut entries) = tokio::fs::read_dir(&self.cfg.directory).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(meta) = entry.metadata().await {
                if let Ok(modified) = meta.modified() {
                    let modified: chrono::DateTime<chrono::Utc> = modified.into();
                    if modified < cutoff {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
    }

    async fn ensure_open(&self, guard: &mut Option<FileState>) -> Result<()> {
        let now = chrono::Utc::now();
        let rotate = match guard.as_ref() {
            Some(state) => self.needs_rotation(state, now),
            None => true,
        };
        if rotate {
            if guard.is_some() {
                self.prune_old_files().await;
            }
            let path = self.current_file_name(now);
            let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await.map_err(crate::Error::Io)?;
            info!(path = %path.display(), "log sink rotated");
            *guard = Some(FileState { file, path, bytes_written: 0, opened_at: now });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LogSink for FileSink {
    async fn write_batch(&self, records: &[serde_json::Value]) -> Result<()> {
        let mut guard = self.state.lock().await;
        self.ensure_open(&mut guard).await?;
        let state = guard.as_mut().expect("ensure_open populates state");
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            state.file.write_all(&line).await.map_err(crate::Error::Io)?;
            state.bytes_written += line.len() as u64;
        }
        state.file.flush().await.map_err(crate::Error::Io)?;
        Ok(())
    }
}

/// Stand-in for SQL/MongoDB/Elasticsearch/ClickHouse sinks: writes each
/// batch through `tracing` so the pipeline is wired end-to-end, without
/// taking on an external store's client crate for functionality this
/// build doesn't exercise.
pub struct TracingSink {
    pub backend_name: &'static str,
}

#[async_trait::async_trait]
impl LogSink for TracingSink {
    async fn write_batch(&self, records: &[serde_json::Value]) -> Result<()> {
        for record in records {
            tracing::info!(backend = self.backend_name, record = %record, "access log record");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_sink_writes_and_rotates_by_size() {
        let dir = std::env::temp_dir().join(format!("logpipe-test-{}", uuid::Uuid::new_v4()));
        let cfg = FileSinkConfig {
            directory: dir.clone(),
            file_prefix: "access".into(),
            rotation: RotationPolicy::Size,
            max_size_bytes: 10,
            retention_days: 7,
        };
        let sink = FileSink::new(cfg).await.unwrap();
        sink.write_batch(&[serde_json::json!({"a": 1})]).await.unwrap();
        sink.write_batch(&[serde_json::json!({"a": 2})]).await.unwrap();

        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert!(count >= 1);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn tracing_sink_never_errors() {
        let sink = TracingSink { backend_name: "elasticsearch" };
        assert!(sink.write_batch(&[serde_json::json!({"x": true})]).await.is_ok());
    }
}
