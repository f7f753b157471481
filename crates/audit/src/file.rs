//! Newline-delimited JSON audit log with size-based rotation.
//!
//! The active file is `path`; rotated files are `path.1` (newest) through
//! `path.N` (oldest). When the active file reaches `max_file_bytes` it is
//! shifted to `.1` before the next batch is written.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::{
        fs,
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        sync::Mutex,
    },
    tracing::{debug, warn},
};

use crate::{
    buffer::EventBuffer,
    error::AuditError,
    event::{AuditEvent, AuditQuery},
    provider::AuditProvider,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileAuditConfig {
    pub path: PathBuf,
    pub max_file_bytes: u64,
    /// Rotated files kept next to the active one.
    pub max_files: usize,
    pub batch_size: usize,
}

impl Default for FileAuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/audit.log"),
            max_file_bytes: 10 * 1024 * 1024,
            max_files: 5,
            batch_size: 100,
        }
    }
}

pub struct FileAuditProvider {
    config: FileAuditConfig,
    buffer: EventBuffer,
    write_lock: Mutex<()>,
}

impl FileAuditProvider {
    pub fn new(config: FileAuditConfig) -> Self {
        Self {
            buffer: EventBuffer::new(config.batch_size),
            write_lock: Mutex::new(()),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = self.config.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    async fn maybe_rotate(&self) -> Result<(), AuditError> {
        let size = match fs::metadata(&self.config.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size < self.config.max_file_bytes {
            return Ok(());
        }

        let max = self.config.max_files;
        if max == 0 {
            fs::remove_file(&self.config.path).await?;
            return Ok(());
        }
        let _ = fs::remove_file(self.rotated_path(max)).await;
        for index in (1..max).rev() {
            let from = self.rotated_path(index);
            if fs::try_exists(&from).await.unwrap_or(false) {
                fs::rename(&from, self.rotated_path(index + 1)).await?;
            }
        }
        fs::rename(&self.config.path, self.rotated_path(1)).await?;
        debug!(path = %self.config.path.display(), size, "rotated audit log");
        Ok(())
    }

    async fn write_batch(&self, batch: &[AuditEvent]) -> Result<(), AuditError> {
        let mut payload = String::new();
        for event in batch {
            payload.push_str(&serde_json::to_string(event)?);
            payload.push('\n');
        }

        self.maybe_rotate().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_file(path: &Path) -> Vec<AuditEvent> {
        let Ok(file) = fs::File::open(path).await else {
            return Vec::new();
        };
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable audit line"),
            }
        }
        events
    }
}

#[async_trait]
impl AuditProvider for FileAuditProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn init(&self) -> Result<(), AuditError> {
        if let Some(parent) = self.config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.buffer.push(event).await {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().await;
        let batch = self.buffer.take().await;
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_batch(&batch).await {
            warn!(count = batch.len(), error = %e, "audit file write failed, requeueing batch");
            self.buffer.requeue(batch).await;
            return Err(e);
        }
        Ok(())
    }

    fn supports_query(&self) -> bool {
        true
    }

    /// Reads rotated files oldest first, then the active file.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let _guard = self.write_lock.lock().await;
        let mut events = Vec::new();
        for index in (1..=self.config.max_files).rev() {
            events.extend(Self::read_file(&self.rotated_path(index)).await);
        }
        events.extend(Self::read_file(&self.config.path).await);
        Ok(query.apply(events))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::event::AuditOutcome};

    fn event(i: usize) -> AuditEvent {
        AuditEvent::new("gw", "message.received", format!("a{i}"), AuditOutcome::Allowed)
            .with_session("s1")
    }

    #[tokio::test]
    async fn writes_ndjson_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileAuditProvider::new(FileAuditConfig {
            path: dir.path().join("nested/audit.log"),
            ..Default::default()
        });
        provider.init().await.unwrap();
        provider.log(event(1)).await.unwrap();
        provider.log(event(2)).await.unwrap();
        assert!(!provider.path().exists());

        provider.close().await.unwrap();
        let raw = std::fs::read_to_string(provider.path()).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "a1");
        assert_eq!(first["sessionId"], "s1");
    }

    #[tokio::test]
    async fn rotates_and_keeps_at_most_n_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileAuditProvider::new(FileAuditConfig {
            path: dir.path().join("audit.log"),
            max_file_bytes: 1,
            max_files: 2,
            batch_size: 1,
        });
        provider.init().await.unwrap();
        for i in 0..5 {
            provider.log(event(i)).await.unwrap();
        }

        assert!(dir.path().join("audit.log").exists());
        assert!(dir.path().join("audit.log.1").exists());
        assert!(dir.path().join("audit.log.2").exists());
        assert!(!dir.path().join("audit.log.3").exists());

        // Oldest surviving event is in .2, newest in the active file.
        let all = provider.query(&AuditQuery::default()).await.unwrap();
        let actions: Vec<_> = all.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["a2", "a3", "a4"]);
    }

    #[tokio::test]
    async fn failed_write_keeps_events_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        // The parent is a file, so opening the log fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let provider = FileAuditProvider::new(FileAuditConfig {
            path: blocker.join("audit.log"),
            batch_size: 10,
            ..Default::default()
        });
        provider.log(event(1)).await.unwrap();
        assert!(provider.flush().await.is_err());
        assert_eq!(provider.buffer.len().await, 1);
    }
}
