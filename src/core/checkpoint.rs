//! Checkpoint stores and the checkpointed retry executor.
//!
//! A checkpoint records that a shard's unit of work already succeeded for a
//! run. Keys are `ckpt:v1:{runId}:{shardId}` regardless of store.
//!
//! The durable store is an append-only JSONL log: every `set` appends a
//! value record, every `delete` a tombstone, and opening the store replays
//! the log with last-write-wins.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, instrument, warn};

use super::retry::{RandomSource, RetryPolicy, Sleeper, ThreadRandom, TokioSleeper};

/// Key of the checkpoint for one shard of one run
pub fn checkpoint_key(run_id: &str, shard_id: &str) -> String {
    format!("ckpt:v1:{}:{}", run_id, shard_id)
}

/// Prefix shared by every checkpoint of a run
pub fn run_prefix(run_id: &str) -> String {
    format!("ckpt:v1:{}:", run_id)
}

/// Checkpoint store failures
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt checkpoint log {path} at line {line}: {detail}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },
}

/// Key-value store of completed units of work
#[async_trait]
pub trait CheckpointStore<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CheckpointError>;

    async fn set(&self, key: &str, value: V) -> Result<(), CheckpointError>;

    /// Returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, CheckpointError>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, CheckpointError>;
}

/// Ephemeral store, one per run
#[derive(Debug)]
pub struct MemoryCheckpointStore<V> {
    entries: RwLock<BTreeMap<String, V>>,
}

impl<V> Default for MemoryCheckpointStore<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V> MemoryCheckpointStore<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<V> CheckpointStore<V> for MemoryCheckpointStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CheckpointError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: V) -> Result<(), CheckpointError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CheckpointError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CheckpointError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One line of the durable checkpoint log
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: Deserialize<'de>"))]
struct CheckpointRecord<V> {
    ts: String,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<V>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    deleted: bool,
}

/// Durable store: append-only JSONL with an exclusive lock per append
#[derive(Debug)]
pub struct JsonlCheckpointStore<V> {
    path: PathBuf,
    entries: AsyncMutex<BTreeMap<String, V>>,
}

impl<V> JsonlCheckpointStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open (or create) the log at `path` and replay it
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let entries = replay_log(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "Opened checkpoint log");
        Ok(Self {
            path,
            entries: AsyncMutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &CheckpointRecord<V>) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;

        file.lock_exclusive().map_err(io_err)?;
        writeln!(file, "{}", json).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        // Lock is released when file is dropped
        Ok(())
    }
}

fn replay_log<V: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, V>, CheckpointError> {
    let mut entries = BTreeMap::new();
    if !path.exists() {
        return Ok(entries);
    }

    let file = fs::File::open(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CheckpointRecord<V> =
            serde_json::from_str(&line).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                detail: e.to_string(),
            })?;

        match record.value {
            Some(value) if !record.deleted => {
                entries.insert(record.key, value);
            }
            _ => {
                entries.remove(&record.key);
            }
        }
    }

    Ok(entries)
}

#[async_trait]
impl<V> CheckpointStore<V> for JsonlCheckpointStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CheckpointError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: V) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().await;
        self.append(&CheckpointRecord {
            ts: Utc::now().to_rfc3339(),
            key: key.to_string(),
            value: Some(value.clone()),
            deleted: false,
        })?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CheckpointError> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            return Ok(false);
        }
        self.append(&CheckpointRecord {
            ts: Utc::now().to_rfc3339(),
            key: key.to_string(),
            value: None,
            deleted: true,
        })?;
        entries.remove(key);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CheckpointError> {
        Ok(self
            .entries
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Result of one checkpointed execution
#[derive(Debug, Clone, PartialEq)]
pub struct Execution<V> {
    pub value: V,
    pub from_checkpoint: bool,
    /// Attempts made in this execution (0 when served from checkpoint)
    pub attempts: u32,
    /// Backoff delays slept between attempts
    pub delays_ms: Vec<u64>,
}

/// Why a checkpointed execution produced no value
#[derive(Debug, Error)]
pub enum ExecutionError<E> {
    #[error("Work failed after {attempts} attempt(s): {error}")]
    Work {
        error: E,
        attempts: u32,
        delays_ms: Vec<u64>,
    },

    #[error(transparent)]
    Store(#[from] CheckpointError),
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

fn lock_map(locks: &LockMap) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registration of one caller in the per-key lock table.
///
/// The entry is removed when its last registered caller goes away, so the
/// table only holds keys with executions in flight.
struct KeyLock<'a> {
    locks: &'a LockMap,
    key: String,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = lock_map(self.locks);
        // The table and this registration are the only holders
        let idle = locks
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}

/// Runs units of work at most once per key, with bounded retries.
///
/// `get -> work -> set` for one key is serialized by a per-key async lock,
/// so two concurrent executions of the same key never both run the work.
pub struct CheckpointExecutor<V> {
    store: Arc<dyn CheckpointStore<V>>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
    locks: LockMap,
}

impl<V> CheckpointExecutor<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn CheckpointStore<V>>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            sleeper: Arc::new(TokioSleeper),
            random: Arc::new(ThreadRandom),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore<V>> {
        &self.store
    }

    fn key_lock(&self, key: &str) -> KeyLock<'_> {
        let mut locks = lock_map(&self.locks);
        let lock = locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        KeyLock {
            locks: &self.locks,
            key: key.to_string(),
            lock,
        }
    }

    /// Serve `key` from the store, or run `work` until it succeeds.
    ///
    /// `work` receives the 1-based attempt number. Errors for which
    /// `is_transient` is false stop retrying immediately. A successful value
    /// is written to the store before it is returned.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn execute<F, Fut, E, P>(
        &self,
        key: &str,
        mut work: F,
        is_transient: P,
    ) -> Result<Execution<V>, ExecutionError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let entry = self.key_lock(key);
        let _guard = entry.lock.lock().await;

        if let Some(value) = self.store.get(key).await? {
            debug!("Checkpoint hit");
            return Ok(Execution {
                value,
                from_checkpoint: true,
                attempts: 0,
                delays_ms: Vec::new(),
            });
        }

        let mut delays_ms = Vec::new();
        let mut attempt = 1u32;
        loop {
            match work(attempt).await {
                Ok(value) => {
                    self.store.set(key, value.clone()).await?;
                    return Ok(Execution {
                        value,
                        from_checkpoint: false,
                        attempts: attempt,
                        delays_ms,
                    });
                }
                Err(error) => {
                    if !is_transient(&error) || !self.policy.should_retry(attempt) {
                        return Err(ExecutionError::Work {
                            error,
                            attempts: attempt,
                            delays_ms,
                        });
                    }

                    let delay = self.policy.delay_ms(attempt, self.random.next_f64());
                    warn!(attempt, delay_ms = delay, error = %error, "Transient failure, retrying");
                    delays_ms.push(delay);
                    self.sleeper
                        .sleep(std::time::Duration::from_millis(delay))
                        .await;
                    attempt += 1;
                }
            }
        }
    }
}
