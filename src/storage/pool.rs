use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::core::config::PoolConfig;
use crate::core::errors::{EngineError, Result};
use crate::storage::connection::{ConnectError, ConnectionFactory, StoreConnection};

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Initializing,
    Ready,
    /// Fewer live connections than requested, possibly none
    Degraded,
    Closed,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Uninitialized => "uninitialized",
            PoolState::Initializing => "initializing",
            PoolState::Ready => "ready",
            PoolState::Degraded => "degraded",
            PoolState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    /// Connection slots attempted across all initialisation passes
    pub creation_attempts: u64,
    /// Rename and delete remediations tried
    pub remediation_attempts: u64,
    pub backups_made: u64,
    pub live: usize,
    pub idle: usize,
    pub discarded: u64,
    pub last_error: Option<String>,
}

struct PoolEntry {
    conn: Box<dyn StoreConnection>,
    created_at: DateTime<Utc>,
    healthy: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: watch::Sender<PoolState>,
    idle: Mutex<Vec<PoolEntry>>,
    /// One permit per idle connection
    permits: Arc<Semaphore>,
    live: AtomicUsize,
    init_lock: tokio::sync::Mutex<()>,
    creation_attempts: AtomicU64,
    remediation_attempts: AtomicU64,
    backups_made: AtomicU64,
    discarded: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PoolInner {
    fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    fn set_state(&self, next: PoolState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, path = %self.config.store_path.display(), "Pool state changed");
        }
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    /// Give a connection back, or discard it if it is no longer fit for use
    fn check_in(&self, mut entry: PoolEntry) -> bool {
        entry.healthy = entry.healthy && entry.conn.is_healthy();
        if entry.healthy && self.state() != PoolState::Closed {
            self.idle.lock().push(entry);
            return true;
        }

        let age = Utc::now() - entry.created_at;
        let remaining = self
            .live
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        warn!(
            live = remaining,
            age_secs = age.num_seconds(),
            "Discarded unhealthy connection"
        );
        if remaining == 0 && self.state() == PoolState::Ready {
            self.set_state(PoolState::Degraded);
        }
        false
    }
}

/// Fixed-size pool over a single embedded store.
///
/// Initialisation is fail-fast: the first slot that cannot produce a
/// connection ends the pass and leaves the pool Degraded. A corrupted store is
/// moved aside (or deleted) before giving up on that slot.
#[derive(Clone)]
pub struct ConnectionPoolManager {
    inner: Arc<PoolInner>,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let (state, _) = watch::channel(PoolState::Uninitialized);
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(0)),
                live: AtomicUsize::new(0),
                init_lock: tokio::sync::Mutex::new(()),
                creation_attempts: AtomicU64::new(0),
                remediation_attempts: AtomicU64::new(0),
                backups_made: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.inner.config.store_path
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<PoolState> {
        self.inner.state.subscribe()
    }

    /// Bring the pool up to `target` live connections.
    ///
    /// Concurrent calls are serialized. Returns the resulting state; a
    /// Degraded pool is not an error.
    pub async fn initialize(&self, target: usize) -> Result<PoolState> {
        let inner = &self.inner;
        let _guard = inner.init_lock.lock().await;
        if inner.state() == PoolState::Closed {
            return Err(EngineError::pool_exhausted("pool is closed"));
        }

        inner.set_state(PoolState::Initializing);
        let path = inner.config.store_path.clone();
        let mut halted = false;

        while inner.live.load(Ordering::Acquire) < target {
            inner.creation_attempts.fetch_add(1, Ordering::Relaxed);
            match self.create_connection(&path) {
                Ok(conn) => {
                    inner.idle.lock().push(PoolEntry {
                        conn,
                        created_at: Utc::now(),
                        healthy: true,
                    });
                    inner.live.fetch_add(1, Ordering::AcqRel);
                    inner.permits.add_permits(1);
                }
                Err(e) => {
                    error!(
                        path = %path.display(),
                        live = inner.live.load(Ordering::Acquire),
                        target,
                        error = %e,
                        "Connection creation failed, halting initialisation"
                    );
                    inner.record_error(e.to_string());
                    halted = true;
                    break;
                }
            }
        }

        let state = if halted {
            PoolState::Degraded
        } else {
            PoolState::Ready
        };
        inner.set_state(state);
        Ok(state)
    }

    fn create_connection(&self, path: &Path) -> std::result::Result<Box<dyn StoreConnection>, ConnectError> {
        match self.inner.factory.connect(path) {
            Ok(conn) => Ok(conn),
            Err(ConnectError::Corrupted(message)) => {
                warn!(path = %path.display(), error = %message, "Store corrupted, attempting remediation");
                self.remediate(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Move the corrupted store aside and retry; failing that, delete it and retry once
    fn remediate(&self, path: &Path) -> std::result::Result<Box<dyn StoreConnection>, ConnectError> {
        let inner = &self.inner;
        inner.factory.release(path);

        inner.remediation_attempts.fetch_add(1, Ordering::Relaxed);
        let backup = backup_path(path, &inner.config.backup_suffix, Utc::now());
        match std::fs::rename(path, &backup) {
            Ok(()) => {
                inner.backups_made.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), backup = %backup.display(), "Moved corrupted store aside");
                match inner.factory.connect(path) {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Fresh store after backup failed");
                    }
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not back up corrupted store");
            }
        }

        inner.remediation_attempts.fetch_add(1, Ordering::Relaxed);
        inner.factory.release(path);
        if let Err(e) = remove_store(path) {
            return Err(ConnectError::Corrupted(format!(
                "could not delete corrupted store {}: {}",
                path.display(),
                e
            )));
        }
        warn!(path = %path.display(), "Deleted corrupted store, retrying once");
        inner.factory.connect(path)
    }

    /// Take a connection, waiting up to the configured acquire timeout
    pub async fn borrow(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.state() == PoolState::Closed {
            return Err(EngineError::pool_exhausted("pool is closed"));
        }
        if inner.live.load(Ordering::Acquire) == 0 {
            return Err(EngineError::pool_exhausted(format!(
                "no live connections to {}",
                inner.config.store_path.display()
            )));
        }

        let permit = match tokio::time::timeout(
            inner.config.acquire_timeout,
            inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::pool_exhausted("pool is closed")),
            Err(_) => {
                return Err(EngineError::pool_exhausted(format!(
                    "timed out after {:?} waiting for a connection",
                    inner.config.acquire_timeout
                )))
            }
        };

        let entry = inner.idle.lock().pop();
        match entry {
            Some(entry) => {
                debug!("Connection borrowed");
                Ok(PooledConnection {
                    entry: Some(entry),
                    permit: Some(permit),
                    pool: Arc::clone(inner),
                })
            }
            None => Err(EngineError::internal(
                "connection permit granted with no idle connection",
            )),
        }
    }

    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.borrow().await?;
        conn.read(key)
    }

    pub async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.borrow().await?;
        conn.write(key, value)
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let conn = self.borrow().await?;
        conn.remove(key)
    }

    /// Flush idle connections and refuse further borrows
    pub async fn close(&self) {
        let inner = &self.inner;
        let _guard = inner.init_lock.lock().await;
        inner.set_state(PoolState::Closed);
        inner.permits.close();
        let drained: Vec<PoolEntry> = inner.idle.lock().drain(..).collect();
        for entry in &drained {
            if let Err(e) = entry.conn.flush() {
                warn!(error = %e, "Flush on close failed");
            }
        }
        inner.live.fetch_sub(drained.len(), Ordering::AcqRel);
        drop(drained);
        inner.factory.release(&inner.config.store_path);
        info!(path = %inner.config.store_path.display(), "Pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            state: inner.state(),
            creation_attempts: inner.creation_attempts.load(Ordering::Relaxed),
            remediation_attempts: inner.remediation_attempts.load(Ordering::Relaxed),
            backups_made: inner.backups_made.load(Ordering::Relaxed),
            live: inner.live.load(Ordering::Acquire),
            idle: inner.idle.lock().len(),
            discarded: inner.discarded.load(Ordering::Relaxed),
            last_error: inner.last_error.lock().clone(),
        }
    }
}

/// `<path>.<suffix>-<timestamp>`
fn backup_path(path: &Path, suffix: &str, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}-{}", suffix, now.format("%Y%m%dT%H%M%S%.3f")));
    PathBuf::from(name)
}

fn remove_store(path: &Path) -> std::io::Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// A borrowed connection; returns to the pool on drop
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Discard this connection instead of returning it
    pub fn mark_unhealthy(&mut self) {
        if let Some(entry) = self.entry.as_mut() {
            entry.healthy = false;
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        match &self.entry {
            Some(entry) => entry.conn.as_ref(),
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let returned = self.pool.check_in(entry);
        if let Some(permit) = self.permit.take() {
            if returned {
                drop(permit);
            } else {
                permit.forget();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sled_store::SledConnectionFactory;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config(path: PathBuf) -> PoolConfig {
        PoolConfig {
            store_path: path,
            target_size: 3,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_ready_and_borrow() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPoolManager::new(
            config(dir.path().join("store")),
            Arc::new(SledConnectionFactory::new("cache")),
        );
        assert_eq!(pool.state(), PoolState::Uninitialized);
        assert_eq!(pool.initialize(3).await.unwrap(), PoolState::Ready);

        pool.write("k", b"v").await.unwrap();
        assert_eq!(pool.read("k").await.unwrap(), Some(b"v".to_vec()));

        let stats = pool.stats();
        assert_eq!(stats.live, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.creation_attempts, 3);
    }

    #[tokio::test]
    async fn test_borrow_times_out_when_all_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPoolManager::new(
            config(dir.path().join("store")),
            Arc::new(SledConnectionFactory::new("cache")),
        );
        pool.initialize(1).await.unwrap();

        let held = pool.borrow().await.unwrap();
        let err = pool.borrow().await.err().unwrap();
        assert!(matches!(err, EngineError::PoolExhausted { .. }));
        drop(held);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_connection_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPoolManager::new(
            config(dir.path().join("store")),
            Arc::new(SledConnectionFactory::new("cache")),
        );
        pool.initialize(1).await.unwrap();

        let mut conn = pool.borrow().await.unwrap();
        conn.mark_unhealthy();
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.state, PoolState::Degraded);
        assert!(matches!(
            pool.borrow().await.err().unwrap(),
            EngineError::PoolExhausted { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_borrow() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPoolManager::new(
            config(dir.path().join("store")),
            Arc::new(SledConnectionFactory::new("cache")),
        );
        pool.initialize(2).await.unwrap();
        pool.close().await;

        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(pool.stats().live, 0);
        assert!(pool.borrow().await.is_err());
        assert!(pool.initialize(2).await.is_err());
    }

    #[test]
    fn test_backup_path_format() {
        let now = DateTime::parse_from_rfc3339("2024-03-01T09:30:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let backup = backup_path(Path::new("/data/quotes.db"), "corrupt", now);
        assert_eq!(
            backup,
            PathBuf::from("/data/quotes.db.corrupt-20240301T093000.250")
        );
    }
}
