//! Pool start-up against damaged stores.

use import_engine::cache::CacheCoordinator;
use import_engine::coordinator::CoordinatorParts;
use import_engine::storage::{
    ConnectError, ConnectionFactory, ConnectionPoolManager, PoolState, SledConnectionFactory,
    StoreConnection,
};
use import_engine::{
    CacheConfig, EngineConfig, EngineError, ExecutionCoordinator, HandlerRegistry, PoolConfig,
    TaskContext, TaskKind, TaskSpec, TaskState,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Every connection attempt reports corruption
#[derive(Default)]
struct AlwaysCorrupted {
    calls: AtomicUsize,
}

impl ConnectionFactory for AlwaysCorrupted {
    fn connect(&self, _path: &Path) -> Result<Box<dyn StoreConnection>, ConnectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConnectError::Corrupted("bad page checksum".into()))
    }
}

fn pool_config(path: PathBuf) -> PoolConfig {
    PoolConfig {
        store_path: path,
        target_size: 10,
        acquire_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

fn backups_in(dir: &Path, stem: &str) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with(&format!("{}.corrupt-", stem)))
        .collect()
}

#[tokio::test]
async fn damaged_store_is_backed_up_and_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quotes.db");
    std::fs::write(&path, b"not a sled directory").unwrap();

    let pool = ConnectionPoolManager::new(
        pool_config(path.clone()),
        Arc::new(SledConnectionFactory::new("cache")),
    );
    assert_eq!(pool.initialize(3).await.unwrap(), PoolState::Ready);

    let stats = pool.stats();
    assert_eq!(stats.live, 3);
    assert_eq!(stats.backups_made, 1);
    assert_eq!(stats.remediation_attempts, 1);
    assert!(path.is_dir());
    assert_eq!(backups_in(dir.path(), "quotes.db").len(), 1);

    pool.write("k", b"1").await.unwrap();
    assert_eq!(pool.read("k").await.unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn failed_backup_falls_back_to_delete() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quotes.db");
    std::fs::write(&path, b"not a sled directory").unwrap();

    // The backup's parent directory does not exist, so the rename fails
    let config = PoolConfig {
        backup_suffix: "missing-dir/corrupt".to_string(),
        ..pool_config(path.clone())
    };
    let pool = ConnectionPoolManager::new(config, Arc::new(SledConnectionFactory::new("cache")));
    assert_eq!(pool.initialize(2).await.unwrap(), PoolState::Ready);

    let stats = pool.stats();
    assert_eq!(stats.backups_made, 0);
    assert_eq!(stats.remediation_attempts, 2);
    assert_eq!(stats.live, 2);
    // The garbage file was deleted and a fresh store created in its place
    assert!(path.is_dir());
    assert!(!dir.path().join("quotes.db.missing-dir").exists());
    assert!(backups_in(dir.path(), "quotes.db").is_empty());

    pool.write("k", b"1").await.unwrap();
    assert_eq!(pool.read("k").await.unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn unremediable_store_halts_after_first_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quotes.db");
    std::fs::write(&path, b"garbage").unwrap();
    let factory = Arc::new(AlwaysCorrupted::default());

    let pool = ConnectionPoolManager::new(pool_config(path.clone()), factory.clone());
    let state = pool.initialize(10).await.unwrap();

    let stats = pool.stats();
    assert_eq!(state, PoolState::Degraded);
    assert_eq!(stats.creation_attempts, 1);
    // initial connect, after backup, after delete
    assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
    assert_eq!(stats.remediation_attempts, 2);
    assert_eq!(stats.live, 0);
    assert!(stats.last_error.is_some());
    assert_eq!(backups_in(dir.path(), "quotes.db").len(), 1);

    let err = pool.borrow().await.err().unwrap();
    assert!(matches!(err, EngineError::PoolExhausted { .. }));

    // The cache surfaces the outage as an error value
    let cache = CacheCoordinator::new(CacheConfig::default(), pool);
    assert!(cache.get("anything").await.is_err());
    assert!(cache.put("anything", json!(1)).await.is_err());
}

#[tokio::test]
async fn engine_runs_tasks_with_degraded_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::development();
    config.pool.store_path = dir.path().join("store");

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("import", |ctx: TaskContext| async move {
        Ok(json!({"task": ctx.task_id}))
    });
    let parts = CoordinatorParts::new(Arc::new(AlwaysCorrupted::default()));
    let engine = ExecutionCoordinator::with_parts(config, handlers, parts)
        .await
        .unwrap();
    assert_eq!(engine.stats().pool.state, PoolState::Degraded);

    engine
        .submit(TaskSpec::new(
            "fx-rates",
            TaskKind::Import {
                source: "ecb".into(),
                dataset: "fx".into(),
            },
        ))
        .unwrap();
    let task = engine
        .wait_for_task("fx-rates", Duration::from_secs(5))
        .await
        .unwrap();
    // Persisting the record fails; the outcome still stands
    assert_eq!(task.state(), TaskState::Succeeded);
    engine.shutdown().await;
}
