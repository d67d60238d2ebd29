//! Local persistent storage behind the cache.
//!
//! The ring runtime never awaits the store directly. Reads and writes run in
//! their own tasks and report back through the runtime's event channel, so
//! implementations must be `Send + Sync`.
//!
//! - [`LogStore`] appends one JSON line per write, each carrying a CRC-32 of
//!   its key and value, and rebuilds its index by replaying the log on open.
//! - [`MemoryStore`] keeps everything in a map; used without a data dir.
//! - [`OfflineStore`] stands in when the log could not be opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const LOG_FILE: &str = "values.log";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store is offline: {0}")]
    Offline(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Short label for status output.
    fn describe(&self) -> String;
}

/// Opens the store for one worker.
///
/// Without a data dir the worker keeps values in memory only. A log that
/// fails to open leaves the worker running with an [`OfflineStore`].
pub async fn open_store(data_dir: Option<&Path>, worker_index: usize) -> Arc<dyn Store> {
    let Some(data_dir) = data_dir else {
        return Arc::new(MemoryStore::new());
    };

    let location = data_dir.join(format!("worker{worker_index}"));
    match LogStore::open(&location).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(location = %location.display(), error = %err, "failed to open store; running without persistence");
            Arc::new(OfflineStore::new(err.to_string()))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    value: String,
    crc: u32,
}

impl Record {
    fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            crc: record_checksum(key, value),
        }
    }

    fn is_intact(&self) -> bool {
        self.crc == record_checksum(&self.key, &self.value)
    }
}

fn record_checksum(key: &str, value: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[0]);
    hasher.update(value.as_bytes());
    hasher.finalize()
}

struct LogInner {
    index: HashMap<String, String>,
    file: File,
}

/// Append-only log with an in-memory index.
pub struct LogStore {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl LogStore {
    /// Opens (or creates) the log under `dir` and replays it.
    ///
    /// A final line without its newline is a torn write and is cut off so
    /// later appends start on a clean line. Lines that fail to parse or
    /// whose checksum does not match are skipped.
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(LOG_FILE);

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let intact_len = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        if intact_len < contents.len() {
            warn!(
                path = %path.display(),
                dropped = contents.len() - intact_len,
                "ignoring torn record at end of store log"
            );
        }

        let mut index = HashMap::new();
        let mut skipped = 0usize;
        for line in contents[..intact_len].split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Record>(line) {
                Ok(record) if record.is_intact() => {
                    index.insert(record.key, record.value);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "skipped corrupt store records");
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.set_len(intact_len as u64).await?;

        info!(path = %path.display(), keys = index.len(), "opened store log");
        Ok(Self {
            path,
            inner: Mutex::new(LogInner { index, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Store for LogStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.index.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&Record::new(key, value))?;
        line.push(b'\n');

        let mut inner = self.inner.lock().await;
        inner.file.write_all(&line).await?;
        inner.file.flush().await?;
        inner.index.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("log:{}", self.path.display())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Fails every operation with the reason the real store could not open.
pub struct OfflineStore {
    reason: String,
}

impl OfflineStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Store for OfflineStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Offline(self.reason.clone()))
    }

    async fn put(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Offline(self.reason.clone()))
    }

    fn describe(&self) -> String {
        format!("offline ({})", self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path()).await.unwrap();
            store.put("a", "1").await.unwrap();
            store.put("b", "2").await.unwrap();
            store.put("a", "3").await.unwrap();
        }

        let store = LogStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn torn_tail_is_ignored_and_appends_stay_readable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path()).await.unwrap();
            store.put("kept", "yes").await.unwrap();
        }
        let path = dir.path().join(LOG_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(br#"{"key":"lost","val"#);
        std::fs::write(&path, raw).unwrap();

        {
            let store = LogStore::open(dir.path()).await.unwrap();
            assert_eq!(store.get("lost").await.unwrap(), None);
            store.put("after", "ok").await.unwrap();
        }

        let store = LogStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("kept").await.unwrap().as_deref(), Some("yes"));
        assert_eq!(store.get("after").await.unwrap().as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn records_with_bad_checksums_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        let good = serde_json::to_string(&Record::new("good", "1")).unwrap();
        let bad = r#"{"key":"bad","value":"2","crc":1}"#;
        std::fs::write(&path, format!("{good}\n{bad}\nnot json\n")).unwrap();

        let store = LogStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("good").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn open_store_picks_backend() {
        let memory = open_store(None, 0).await;
        assert_eq!(memory.describe(), "memory");

        let dir = tempfile::tempdir().unwrap();
        let log = open_store(Some(dir.path()), 2).await;
        assert!(log.describe().contains("worker2"));
        log.put("k", "v").await.unwrap();
        assert!(dir.path().join("worker2").join(LOG_FILE).exists());

        // A regular file where the shard dir should be makes the log unopenable.
        let blocked = tempfile::tempdir().unwrap();
        std::fs::write(blocked.path().join("worker0"), b"").unwrap();
        let offline = open_store(Some(blocked.path()), 0).await;
        assert!(offline.describe().starts_with("offline"));
        assert!(matches!(offline.get("k").await, Err(StoreError::Offline(_))));
    }
}
